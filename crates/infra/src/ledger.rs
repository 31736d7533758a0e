//! Batch ledger execution.
//!
//! [`LedgerSession`] is the unit of work every mutating engine runs in: it
//! owns one store transaction, fixes the business clock for the operation,
//! and stages a [`StockMovement`] for each quantity or binding change it
//! writes. [`LedgerSession::commit`] appends the staged movements and commits
//! both together; dropping the session instead rolls everything back.
//!
//! The split/merge primitives here keep one invariant for every caller:
//!
//! - quantity only moves between rows that share a merge key (same invoice
//!   line, lot attributes); it is never created or destroyed, except by a
//!   sale or an invoice edit
//! - at most one warehouse row exists per merge key, because stock that
//!   returns to the warehouse is folded into an existing row when one exists
//!
//! [`BatchLedger`] is the read side: lock-free snapshot queries.

use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, Utc};
use tracing::debug;

use pharmastock_core::{BatchId, DomainError, DomainResult, Entity, InvoiceId, ProductId};
use pharmastock_events::EventEnvelope;
use pharmastock_inventory::{
    AdjustReason, Batch, BatchDeleted, BatchMerged, BatchReceived, BatchSplit,
    BatchStatus, BatchUnlinked, MergeKey, QuantityAdjusted, StockMovement, WarehouseQuery,
    select_warehouse_match,
};
use pharmastock_purchasing::InvoiceLine;

use crate::store::{InventoryStore, LedgerTx};

/// One open ledger transaction plus its staged movement journal.
pub struct LedgerSession {
    pub(crate) tx: Box<dyn LedgerTx>,
    now: DateTime<Utc>,
    journal: Vec<StockMovement>,
}

impl LedgerSession {
    pub async fn open(store: &dyn InventoryStore) -> DomainResult<Self> {
        Ok(Self {
            tx: store.begin().await?,
            now: Utc::now(),
            journal: Vec::new(),
        })
    }

    /// Business time of this operation; every row it touches gets this stamp.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn staged(&self) -> &[StockMovement] {
        &self.journal
    }

    /// Lock a batch row, or fail with `NotFound`.
    pub async fn require_batch(&mut self, id: BatchId) -> DomainResult<Batch> {
        self.tx
            .lock_batch(id)
            .await?
            .ok_or_else(|| DomainError::not_found("batch", id))
    }

    /// Create the warehouse row for a freshly received invoice line.
    pub async fn receive(&mut self, invoice_id: InvoiceId, line: &InvoiceLine) -> DomainResult<Batch> {
        let batch = Batch::receive(
            BatchId::new(),
            invoice_id,
            line.line_id,
            line.lot.clone(),
            line.quantity,
            self.now,
        )?;
        self.tx.insert_batch(&batch).await?;
        self.journal.push(StockMovement::Received(BatchReceived {
            batch_id: batch.id(),
            invoice_id,
            line_id: line.line_id,
            quantity: line.quantity,
            occurred_at: self.now,
        }));
        Ok(batch)
    }

    /// Apply a signed quantity change to `batch` and persist it.
    pub async fn adjust_quantity(&mut self, batch: &mut Batch, delta: i64, reason: AdjustReason) -> DomainResult<()> {
        batch.adjust(delta, self.now)?;
        self.tx.update_batch(batch).await?;
        self.journal.push(StockMovement::Adjusted(QuantityAdjusted {
            batch_id: batch.id(),
            delta,
            reason,
            occurred_at: self.now,
        }));
        Ok(())
    }

    /// Lock the warehouse rows `query` could resolve to and pick one.
    pub async fn find_warehouse_match(&mut self, query: &WarehouseQuery) -> DomainResult<Option<Batch>> {
        let candidates = self.tx.lock_warehouse_candidates(query).await?;
        Ok(select_warehouse_match(&candidates, query).cloned())
    }

    /// Largest single warehouse quantity held under `key`.
    pub async fn largest_warehouse_quantity(&mut self, key: MergeKey) -> DomainResult<i64> {
        let candidates = self.tx.lock_warehouse_candidates(&WarehouseQuery::by_key(key, 1)).await?;
        Ok(candidates.iter().map(Batch::remaining_quantity).max().unwrap_or(0))
    }

    /// Split `quantity` off warehouse row `source` into a new row bound to `product_id`.
    pub async fn carve(&mut self, source: &mut Batch, quantity: i64, product_id: ProductId) -> DomainResult<Batch> {
        let bound = source.carve(BatchId::new(), quantity, product_id, self.now)?;
        self.tx.update_batch(source).await?;
        self.tx.insert_batch(&bound).await?;
        self.journal.push(StockMovement::Adjusted(QuantityAdjusted {
            batch_id: source.id(),
            delta: -quantity,
            reason: AdjustReason::Allocation,
            occurred_at: self.now,
        }));
        self.journal.push(StockMovement::Split(BatchSplit {
            batch_id: bound.id(),
            source_id: Some(source.id()),
            product_id: Some(product_id),
            quantity,
            occurred_at: self.now,
        }));
        debug!(source = %source.id(), bound = %bound.id(), quantity, "carved allocation");
        Ok(bound)
    }

    /// Add `quantity` units with `template`'s merge key to the warehouse.
    ///
    /// Credits the existing warehouse row for the key, or opens one.
    pub async fn stock_warehouse(&mut self, template: &Batch, quantity: i64, reason: AdjustReason) -> DomainResult<BatchId> {
        let query = WarehouseQuery::by_key(template.merge_key(), 1);
        match self.find_warehouse_match(&query).await? {
            Some(mut target) => {
                self.adjust_quantity(&mut target, quantity, reason).await?;
                Ok(target.id())
            }
            _ => {
                let twin = template.warehouse_twin(BatchId::new(), quantity, self.now)?;
                self.tx.insert_batch(&twin).await?;
                self.journal.push(StockMovement::Split(BatchSplit {
                    batch_id: twin.id(),
                    source_id: Some(template.id()),
                    product_id: None,
                    quantity,
                    occurred_at: self.now,
                }));
                Ok(twin.id())
            }
        }
    }

    /// Move `quantity` units from bound row `line` back to the warehouse.
    pub async fn return_to_warehouse(&mut self, line: &mut Batch, quantity: i64, reason: AdjustReason) -> DomainResult<BatchId> {
        self.adjust_quantity(line, -quantity, reason).await?;
        self.stock_warehouse(line, quantity, reason).await
    }

    /// Release an allocated row back to the warehouse.
    ///
    /// The row is merged into the warehouse row for its key when one exists
    /// (and removed), otherwise it becomes that warehouse row itself. Returns
    /// the id of the warehouse row now holding the stock.
    pub async fn unbind(&mut self, mut line: Batch) -> DomainResult<BatchId> {
        // Look the match up before the row itself joins the warehouse.
        let query = WarehouseQuery::by_key(line.merge_key(), 1);
        let target = self.find_warehouse_match(&query).await?;

        let Some(product_id) = line.unlink(self.now) else {
            return Err(DomainError::validation(
                "batch_id",
                format!("batch {} is not allocated to a product", line.id()),
            ));
        };
        self.journal.push(StockMovement::Unlinked(BatchUnlinked {
            batch_id: line.id(),
            product_id,
            occurred_at: self.now,
        }));

        match target {
            Some(mut target) => {
                let quantity = line.remaining_quantity();
                self.adjust_quantity(&mut target, quantity, AdjustReason::Merge).await?;
                self.tx.delete_batch(line.id()).await?;
                self.journal.push(StockMovement::Merged(BatchMerged {
                    batch_id: line.id(),
                    into: target.id(),
                    quantity,
                    occurred_at: self.now,
                }));
                Ok(target.id())
            }
            None => {
                self.tx.update_batch(&line).await?;
                Ok(line.id())
            }
        }
    }

    /// Drop `batch`'s product binding, whatever its state.
    ///
    /// The row stays where it is with its quantity: live rows become
    /// unallocated warehouse stock, depleted rows keep their audit trail and
    /// just lose the link. Nothing is merged or deleted.
    pub async fn release(&mut self, mut batch: Batch) -> DomainResult<()> {
        let Some(product_id) = batch.unlink(self.now) else {
            return Ok(());
        };
        self.tx.update_batch(&batch).await?;
        self.journal.push(StockMovement::Unlinked(BatchUnlinked {
            batch_id: batch.id(),
            product_id,
            occurred_at: self.now,
        }));
        Ok(())
    }

    pub async fn delete_batch(&mut self, batch: &Batch) -> DomainResult<()> {
        self.tx.delete_batch(batch.id()).await?;
        self.journal.push(StockMovement::Deleted(BatchDeleted {
            batch_id: batch.id(),
            occurred_at: self.now,
        }));
        Ok(())
    }

    /// Append the staged journal and commit. Returns the number of movements written.
    pub async fn commit(mut self) -> DomainResult<usize> {
        let journal = std::mem::take(&mut self.journal);
        let written = journal.len();
        if !journal.is_empty() {
            self.tx.append_movements(journal).await?;
        }
        self.tx.commit().await?;
        Ok(written)
    }
}

/// Read-only queries over committed batch rows.
#[derive(Clone)]
pub struct BatchLedger {
    store: Arc<dyn InventoryStore>,
}

impl BatchLedger {
    pub fn new(store: Arc<dyn InventoryStore>) -> Self {
        Self { store }
    }

    pub async fn batch(&self, id: BatchId) -> DomainResult<Batch> {
        self.store
            .batch(id)
            .await?
            .ok_or_else(|| DomainError::not_found("batch", id))
    }

    pub async fn batch_status(&self, id: BatchId) -> DomainResult<BatchStatus> {
        Ok(self.batch(id).await?.status())
    }

    /// Unallocated rows, FEFO order.
    pub async fn warehouse_stock(&self) -> DomainResult<Vec<Batch>> {
        let mut rows = self.store.warehouse_batches().await?;
        rows.sort_by(|a, b| a.fefo_cmp(b));
        Ok(rows)
    }

    /// Live rows expiring on or before `today + days`, FEFO order.
    pub async fn expiring_within(&self, days: u32, today: NaiveDate) -> DomainResult<Vec<Batch>> {
        let cutoff = today
            .checked_add_days(Days::new(u64::from(days)))
            .ok_or_else(|| DomainError::validation("within_days", "out of range"))?;
        let mut rows = self.store.expiring_batches(cutoff).await?;
        rows.retain(|b| b.status() != BatchStatus::Depleted);
        rows.sort_by(|a, b| a.fefo_cmp(b));
        Ok(rows)
    }

    pub async fn movements_for_batch(&self, id: BatchId) -> DomainResult<Vec<EventEnvelope<StockMovement>>> {
        self.store.movements(id).await
    }
}
