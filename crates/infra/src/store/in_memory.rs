use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use pharmastock_core::{
    BatchId, DomainError, DomainResult, Entity, InvoiceId, LineId, ProductId, SaleId,
};
use pharmastock_events::EventEnvelope;
use pharmastock_inventory::{Batch, BatchStatus, MergeKey, StockMovement, WarehouseQuery};
use pharmastock_products::Product;
use pharmastock_purchasing::PurchaseInvoice;
use pharmastock_sales::SaleTransaction;

use super::r#trait::{InventoryStore, LedgerTx};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

macro_rules! detach {
    ($index:expr, $key:expr, $id:expr) => {
        if let Some(ids) = $index.get_mut($key) {
            ids.remove($id);
            if ids.is_empty() {
                $index.remove($key);
            }
        }
    };
}

/// Arena of batch rows plus the indexes the engines query by.
#[derive(Debug, Clone, Default)]
struct Ledger {
    batches: BTreeMap<BatchId, Batch>,
    by_product: BTreeMap<ProductId, BTreeSet<BatchId>>,
    by_line: BTreeMap<(InvoiceId, LineId), BTreeSet<BatchId>>,
    warehouse_by_key: HashMap<MergeKey, BTreeSet<BatchId>>,
    warehouse_by_name: BTreeMap<String, BTreeSet<BatchId>>,

    products: BTreeMap<ProductId, Product>,
    invoices: BTreeMap<InvoiceId, PurchaseInvoice>,
    invoice_numbers: BTreeMap<String, InvoiceId>,
    sales: BTreeMap<SaleId, SaleTransaction>,
    sold_products: BTreeSet<ProductId>,
    movements: BTreeMap<BatchId, Vec<EventEnvelope<StockMovement>>>,
}

impl Ledger {
    fn put_batch(&mut self, batch: Batch) {
        if let Some(old) = self.batches.remove(&batch.id()) {
            self.unindex(&old);
        }
        self.index(&batch);
        self.batches.insert(batch.id(), batch);
    }

    fn remove_batch(&mut self, id: BatchId) -> Option<Batch> {
        let old = self.batches.remove(&id)?;
        self.unindex(&old);
        Some(old)
    }

    fn index(&mut self, batch: &Batch) {
        let id = batch.id();
        if let Some(product_id) = batch.linked_product_id() {
            self.by_product.entry(product_id).or_default().insert(id);
        }
        self.by_line
            .entry((batch.invoice_id(), batch.line_id()))
            .or_default()
            .insert(id);
        if batch.is_in_warehouse() {
            self.warehouse_by_key.entry(batch.merge_key()).or_default().insert(id);
            self.warehouse_by_name
                .entry(batch.product_name().to_string())
                .or_default()
                .insert(id);
        }
    }

    fn unindex(&mut self, batch: &Batch) {
        let id = batch.id();
        if let Some(product_id) = batch.linked_product_id() {
            detach!(self.by_product, &product_id, &id);
        }
        detach!(self.by_line, &(batch.invoice_id(), batch.line_id()), &id);
        if batch.is_in_warehouse() {
            detach!(self.warehouse_by_key, &batch.merge_key(), &id);
            detach!(self.warehouse_by_name, batch.product_name(), &id);
        }
    }

    fn rows<'a>(&self, ids: impl IntoIterator<Item = &'a BatchId>) -> Vec<Batch> {
        ids.into_iter().filter_map(|id| self.batches.get(id)).cloned().collect()
    }

    fn product_rows(&self, product_id: ProductId) -> Vec<Batch> {
        self.rows(self.by_product.get(&product_id).into_iter().flatten())
    }

    fn invoice_rows(&self, invoice_id: InvoiceId) -> Vec<Batch> {
        let mut rows: Vec<Batch> = self
            .by_line
            .range((invoice_id, LineId::from_uuid(uuid::Uuid::nil()))..)
            .take_while(|((inv, _), _)| *inv == invoice_id)
            .flat_map(|(_, ids)| self.rows(ids))
            .collect();
        rows.sort_by_key(|b| b.id());
        rows
    }

    fn warehouse_candidates(&self, query: &WarehouseQuery) -> Vec<Batch> {
        let ids = match &query.key {
            Some(key) => self.warehouse_by_key.get(key),
            None => self.warehouse_by_name.get(&query.product_name),
        };
        self.rows(ids.into_iter().flatten())
            .into_iter()
            .filter(|b| query.matches(b))
            .collect()
    }
}

/// In-memory store: one arena guarded by a single writer lock.
///
/// Transactions are serialized. Each one works on a private copy of the
/// arena that replaces the committed snapshot on commit; readers use the
/// last committed snapshot and never wait for a writer.
#[derive(Debug, Clone)]
pub struct InMemoryInventoryStore {
    committed: Arc<RwLock<Arc<Ledger>>>,
    writer: Arc<Mutex<()>>,
    lock_timeout: Duration,
}

impl Default for InMemoryInventoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            committed: Arc::new(RwLock::new(Arc::new(Ledger::default()))),
            writer: Arc::new(Mutex::new(())),
            lock_timeout,
        }
    }

    fn snapshot(&self) -> DomainResult<Arc<Ledger>> {
        self.committed
            .read()
            .map(|ledger| Arc::clone(&ledger))
            .map_err(|_| DomainError::storage("ledger snapshot lock poisoned"))
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn begin(&self) -> DomainResult<Box<dyn LedgerTx>> {
        let guard = tokio::time::timeout(self.lock_timeout, Arc::clone(&self.writer).lock_owned())
            .await
            .map_err(|_| {
                let waited_ms = self.lock_timeout.as_millis() as u64;
                warn!(waited_ms, "ledger lock not acquired in time");
                DomainError::contention(format!("ledger is busy; lock not acquired within {waited_ms}ms"))
            })?;

        let working = (*self.snapshot()?).clone();
        Ok(Box::new(InMemoryTx {
            working,
            committed: Arc::clone(&self.committed),
            _writer: guard,
        }))
    }

    async fn batch(&self, id: BatchId) -> DomainResult<Option<Batch>> {
        Ok(self.snapshot()?.batches.get(&id).cloned())
    }

    async fn product_batches(&self, product_id: ProductId) -> DomainResult<Vec<Batch>> {
        Ok(self.snapshot()?.product_rows(product_id))
    }

    async fn warehouse_batches(&self) -> DomainResult<Vec<Batch>> {
        let ledger = self.snapshot()?;
        let mut rows = ledger.rows(ledger.warehouse_by_name.values().flatten());
        rows.sort_by_key(|b| b.id());
        Ok(rows)
    }

    async fn expiring_batches(&self, cutoff: NaiveDate) -> DomainResult<Vec<Batch>> {
        Ok(self
            .snapshot()?
            .batches
            .values()
            .filter(|b| b.status() != BatchStatus::Depleted)
            .filter(|b| b.expiry_date().is_some_and(|d| d <= cutoff))
            .cloned()
            .collect())
    }

    async fn invoice_batches(&self, invoice_id: InvoiceId) -> DomainResult<Vec<Batch>> {
        Ok(self.snapshot()?.invoice_rows(invoice_id))
    }

    async fn product(&self, id: ProductId) -> DomainResult<Option<Product>> {
        Ok(self.snapshot()?.products.get(&id).cloned())
    }

    async fn invoice(&self, id: InvoiceId) -> DomainResult<Option<PurchaseInvoice>> {
        Ok(self.snapshot()?.invoices.get(&id).cloned())
    }

    async fn sale(&self, id: SaleId) -> DomainResult<Option<SaleTransaction>> {
        Ok(self.snapshot()?.sales.get(&id).cloned())
    }

    async fn movements(&self, batch_id: BatchId) -> DomainResult<Vec<EventEnvelope<StockMovement>>> {
        Ok(self
            .snapshot()?
            .movements
            .get(&batch_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// A staged copy of the ledger plus the writer lock it was taken under.
struct InMemoryTx {
    working: Ledger,
    committed: Arc<RwLock<Arc<Ledger>>>,
    _writer: OwnedMutexGuard<()>,
}

#[async_trait]
impl LedgerTx for InMemoryTx {
    async fn lock_batch(&mut self, id: BatchId) -> DomainResult<Option<Batch>> {
        Ok(self.working.batches.get(&id).cloned())
    }

    async fn lock_product_batches(&mut self, product_id: ProductId) -> DomainResult<Vec<Batch>> {
        Ok(self.working.product_rows(product_id))
    }

    async fn lock_line_batches(&mut self, invoice_id: InvoiceId, line_id: LineId) -> DomainResult<Vec<Batch>> {
        Ok(self
            .working
            .rows(self.working.by_line.get(&(invoice_id, line_id)).into_iter().flatten()))
    }

    async fn lock_invoice_batches(&mut self, invoice_id: InvoiceId) -> DomainResult<Vec<Batch>> {
        Ok(self.working.invoice_rows(invoice_id))
    }

    async fn lock_warehouse_candidates(&mut self, query: &WarehouseQuery) -> DomainResult<Vec<Batch>> {
        Ok(self.working.warehouse_candidates(query))
    }

    async fn insert_batch(&mut self, batch: &Batch) -> DomainResult<()> {
        if self.working.batches.contains_key(&batch.id()) {
            return Err(DomainError::conflict(format!("batch {} already exists", batch.id())));
        }
        self.working.put_batch(batch.clone());
        Ok(())
    }

    async fn update_batch(&mut self, batch: &Batch) -> DomainResult<()> {
        if !self.working.batches.contains_key(&batch.id()) {
            return Err(DomainError::not_found("batch", batch.id()));
        }
        self.working.put_batch(batch.clone());
        Ok(())
    }

    async fn delete_batch(&mut self, id: BatchId) -> DomainResult<()> {
        self.working
            .remove_batch(id)
            .map(|_| ())
            .ok_or_else(|| DomainError::not_found("batch", id))
    }

    async fn lock_product(&mut self, id: ProductId) -> DomainResult<Option<Product>> {
        Ok(self.working.products.get(&id).cloned())
    }

    async fn insert_product(&mut self, product: &Product) -> DomainResult<()> {
        if self.working.products.contains_key(&product.id()) {
            return Err(DomainError::conflict(format!("product {} already exists", product.id())));
        }
        self.working.products.insert(product.id(), product.clone());
        Ok(())
    }

    async fn update_product(&mut self, product: &Product) -> DomainResult<()> {
        match self.working.products.get_mut(&product.id()) {
            Some(slot) => {
                *slot = product.clone();
                Ok(())
            }
            None => Err(DomainError::not_found("product", product.id())),
        }
    }

    async fn delete_product(&mut self, id: ProductId) -> DomainResult<()> {
        self.working
            .products
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| DomainError::not_found("product", id))
    }

    async fn product_has_sales(&mut self, id: ProductId) -> DomainResult<bool> {
        Ok(self.working.sold_products.contains(&id))
    }

    async fn lock_invoice(&mut self, id: InvoiceId) -> DomainResult<Option<PurchaseInvoice>> {
        Ok(self.working.invoices.get(&id).cloned())
    }

    async fn invoice_number_taken(&mut self, invoice_number: &str, except: Option<InvoiceId>) -> DomainResult<bool> {
        Ok(self
            .working
            .invoice_numbers
            .get(invoice_number)
            .is_some_and(|owner| Some(*owner) != except))
    }

    async fn insert_invoice(&mut self, invoice: &PurchaseInvoice) -> DomainResult<()> {
        if self.invoice_number_taken(invoice.invoice_number(), None).await? {
            return Err(DomainError::conflict(format!(
                "invoice number {} already exists",
                invoice.invoice_number()
            )));
        }
        self.working
            .invoice_numbers
            .insert(invoice.invoice_number().to_string(), invoice.id());
        self.working.invoices.insert(invoice.id(), invoice.clone());
        Ok(())
    }

    async fn update_invoice(&mut self, invoice: &PurchaseInvoice) -> DomainResult<()> {
        if self.invoice_number_taken(invoice.invoice_number(), Some(invoice.id())).await? {
            return Err(DomainError::conflict(format!(
                "invoice number {} already exists",
                invoice.invoice_number()
            )));
        }
        let Some(previous) = self.working.invoices.insert(invoice.id(), invoice.clone()) else {
            self.working.invoices.remove(&invoice.id());
            return Err(DomainError::not_found("invoice", invoice.id()));
        };
        self.working.invoice_numbers.remove(previous.invoice_number());
        self.working
            .invoice_numbers
            .insert(invoice.invoice_number().to_string(), invoice.id());
        Ok(())
    }

    async fn delete_invoice(&mut self, id: InvoiceId) -> DomainResult<()> {
        let removed = self
            .working
            .invoices
            .remove(&id)
            .ok_or_else(|| DomainError::not_found("invoice", id))?;
        self.working.invoice_numbers.remove(removed.invoice_number());
        Ok(())
    }

    async fn insert_sale(&mut self, sale: &SaleTransaction) -> DomainResult<()> {
        self.working
            .sold_products
            .extend(sale.lines().iter().map(|l| l.product_id));
        self.working.sales.insert(sale.id(), sale.clone());
        Ok(())
    }

    async fn append_movements(&mut self, movements: Vec<StockMovement>) -> DomainResult<()> {
        for movement in movements {
            let batch_id = movement.batch_id();
            let stream = self.working.movements.entry(batch_id).or_default();
            let sequence_number = stream.len() as u64 + 1;
            stream.push(EventEnvelope::seal(sequence_number, movement));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DomainResult<()> {
        let InMemoryTx {
            working,
            committed,
            _writer,
        } = *self;
        let mut slot = committed
            .write()
            .map_err(|_| DomainError::storage("ledger snapshot lock poisoned"))?;
        *slot = Arc::new(working);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pharmastock_inventory::{AdjustReason, LotSpec, QuantityAdjusted};

    fn lot(name: &str) -> LotSpec {
        LotSpec {
            product_name: name.to_string(),
            packaging_unit: "box".to_string(),
            unit_cost: 1000,
            expiry_date: NaiveDate::from_ymd_opt(2025, 12, 31),
        }
    }

    fn received(name: &str, qty: i64) -> Batch {
        Batch::receive(BatchId::new(), InvoiceId::new(), LineId::new(), lot(name), qty, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_and_dropped() {
        let store = InMemoryInventoryStore::new();
        let batch = received("Amoxicillin", 10);

        let mut tx = store.begin().await.unwrap();
        tx.insert_batch(&batch).await.unwrap();
        assert!(tx.lock_batch(batch.id()).await.unwrap().is_some());
        assert!(store.batch(batch.id()).await.unwrap().is_none());
        drop(tx);

        assert!(store.batch(batch.id()).await.unwrap().is_none());
        let tx = store.begin().await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.batch(batch.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_writer_times_out_as_retryable_conflict() {
        let store = InMemoryInventoryStore::with_lock_timeout(Duration::from_millis(20));
        let held = store.begin().await.unwrap();

        let err = store.begin().await.err().unwrap();
        assert!(matches!(err, DomainError::Conflict { retryable: true, .. }));
        assert!(err.is_retryable());

        drop(held);
        assert!(store.begin().await.is_ok());
    }

    #[tokio::test]
    async fn warehouse_index_follows_binding_changes() {
        let store = InMemoryInventoryStore::new();
        let mut source = received("Amoxicillin", 10);
        let product = ProductId::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_batch(&source).await.unwrap();
        let bound = source.carve(BatchId::new(), 10, product, Utc::now()).unwrap();
        tx.update_batch(&source).await.unwrap();
        tx.insert_batch(&bound).await.unwrap();

        let query = WarehouseQuery::by_key(source.merge_key(), 1);
        assert!(tx.lock_warehouse_candidates(&query).await.unwrap().is_empty());
        assert_eq!(tx.lock_product_batches(product).await.unwrap(), vec![bound.clone()]);
        assert_eq!(tx.lock_invoice_batches(source.invoice_id()).await.unwrap().len(), 2);
        tx.commit().await.unwrap();

        assert!(store.warehouse_batches().await.unwrap().is_empty());
        assert_eq!(store.product_batches(product).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn movements_are_sequenced_per_batch() {
        let store = InMemoryInventoryStore::new();
        let batch_id = BatchId::new();
        let adjusted = |delta| {
            StockMovement::Adjusted(QuantityAdjusted {
                batch_id,
                delta,
                reason: AdjustReason::Sale,
                occurred_at: Utc::now(),
            })
        };

        let mut tx = store.begin().await.unwrap();
        tx.append_movements(vec![adjusted(-1), adjusted(-2)]).await.unwrap();
        tx.commit().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.append_movements(vec![adjusted(-3)]).await.unwrap();
        tx.commit().await.unwrap();

        let journal = store.movements(batch_id).await.unwrap();
        let sequence: Vec<u64> = journal.iter().map(|e| e.sequence_number()).collect();
        assert_eq!(sequence, vec![1, 2, 3]);
        assert_eq!(journal[2].payload().quantity_delta(), -3);
        assert_eq!(journal[0].stream_type(), pharmastock_inventory::BATCH_STREAM);
    }
}
