use async_trait::async_trait;
use chrono::NaiveDate;

use pharmastock_core::{BatchId, DomainResult, InvoiceId, LineId, ProductId, SaleId};
use pharmastock_events::EventEnvelope;
use pharmastock_inventory::{Batch, StockMovement, WarehouseQuery};
use pharmastock_products::Product;
use pharmastock_purchasing::PurchaseInvoice;
use pharmastock_sales::SaleTransaction;

/// Transactional storage for the batch ledger and everything that references it.
///
/// ## Reads
///
/// The plain read methods take no locks and may observe a slightly stale
/// snapshot. They back quotes, listings and reports.
///
/// ## Writes
///
/// Every mutation goes through a [`LedgerTx`] obtained from [`begin`]. A
/// transaction holds row locks on whatever it read through its `lock_*`
/// methods until it commits or is dropped. Dropping a transaction without
/// calling [`LedgerTx::commit`] rolls back every write made through it, which
/// is how cancelled requests leave no trace.
///
/// Lock acquisition is bounded by the store's lock timeout; running out of
/// time surfaces as a retryable `DomainError::Conflict`.
///
/// [`begin`]: InventoryStore::begin
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn begin(&self) -> DomainResult<Box<dyn LedgerTx>>;

    async fn batch(&self, id: BatchId) -> DomainResult<Option<Batch>>;

    /// Rows linked to `product_id`, depleted ones included.
    async fn product_batches(&self, product_id: ProductId) -> DomainResult<Vec<Batch>>;

    /// Unallocated rows.
    async fn warehouse_batches(&self) -> DomainResult<Vec<Batch>>;

    /// Non-depleted rows expiring on or before `cutoff`.
    async fn expiring_batches(&self, cutoff: NaiveDate) -> DomainResult<Vec<Batch>>;

    async fn invoice_batches(&self, invoice_id: InvoiceId) -> DomainResult<Vec<Batch>>;

    async fn product(&self, id: ProductId) -> DomainResult<Option<Product>>;

    async fn invoice(&self, id: InvoiceId) -> DomainResult<Option<PurchaseInvoice>>;

    async fn sale(&self, id: SaleId) -> DomainResult<Option<SaleTransaction>>;

    /// The journal of one batch row, oldest first.
    async fn movements(&self, batch_id: BatchId) -> DomainResult<Vec<EventEnvelope<StockMovement>>>;
}

/// One open store transaction.
///
/// `lock_*` methods return rows in ascending id order with their locks held.
#[async_trait]
pub trait LedgerTx: Send {
    async fn lock_batch(&mut self, id: BatchId) -> DomainResult<Option<Batch>>;

    async fn lock_product_batches(&mut self, product_id: ProductId) -> DomainResult<Vec<Batch>>;

    /// Every row descended from one invoice line.
    async fn lock_line_batches(&mut self, invoice_id: InvoiceId, line_id: LineId) -> DomainResult<Vec<Batch>>;

    async fn lock_invoice_batches(&mut self, invoice_id: InvoiceId) -> DomainResult<Vec<Batch>>;

    /// Warehouse rows satisfying `query`.
    async fn lock_warehouse_candidates(&mut self, query: &WarehouseQuery) -> DomainResult<Vec<Batch>>;

    async fn insert_batch(&mut self, batch: &Batch) -> DomainResult<()>;

    async fn update_batch(&mut self, batch: &Batch) -> DomainResult<()>;

    async fn delete_batch(&mut self, id: BatchId) -> DomainResult<()>;

    async fn lock_product(&mut self, id: ProductId) -> DomainResult<Option<Product>>;

    async fn insert_product(&mut self, product: &Product) -> DomainResult<()>;

    async fn update_product(&mut self, product: &Product) -> DomainResult<()>;

    async fn delete_product(&mut self, id: ProductId) -> DomainResult<()>;

    /// Whether any recorded sale line references the product.
    async fn product_has_sales(&mut self, id: ProductId) -> DomainResult<bool>;

    async fn lock_invoice(&mut self, id: InvoiceId) -> DomainResult<Option<PurchaseInvoice>>;

    /// Whether another invoice (not `except`) already uses `invoice_number`.
    async fn invoice_number_taken(&mut self, invoice_number: &str, except: Option<InvoiceId>) -> DomainResult<bool>;

    async fn insert_invoice(&mut self, invoice: &PurchaseInvoice) -> DomainResult<()>;

    async fn update_invoice(&mut self, invoice: &PurchaseInvoice) -> DomainResult<()>;

    async fn delete_invoice(&mut self, id: InvoiceId) -> DomainResult<()>;

    async fn insert_sale(&mut self, sale: &SaleTransaction) -> DomainResult<()>;

    /// Append to each movement's batch journal; the store assigns sequence numbers.
    async fn append_movements(&mut self, movements: Vec<StockMovement>) -> DomainResult<()>;

    async fn commit(self: Box<Self>) -> DomainResult<()>;
}
