//! Allocation manager: binds warehouse stock to catalog products and
//! re-partitions it as products are edited.
//!
//! ## Operations
//!
//! - `create_product`: carve part of a warehouse row into a new product
//! - `add_allocation`: bind more warehouse stock to an existing product
//! - `resize_allocation`: bring one bound row to an absolute quantity
//! - `release_all`: unlink every row of a product, leaving its stock in place
//!
//! Each runs in one [`LedgerSession`]. Resizing is also exposed as
//! [`resize_line`] so the catalog can apply a whole set of line edits inside
//! its own session.
//!
//! ## Locking order
//!
//! Product row first, then batch rows. The sale engine follows the same
//! order, so the two never wait on each other in a cycle.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use pharmastock_core::{BatchId, DomainError, DomainResult, Entity, ProductId};
use pharmastock_inventory::{AdjustReason, Batch, ResizePlan, WarehouseQuery, plan_resize};
use pharmastock_products::{Product, ProductAttrs};

use crate::ledger::LedgerSession;
use crate::store::InventoryStore;

/// Outcome of binding stock to a product.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub product: Product,
    /// The row now holding the bound quantity.
    pub line: Batch,
}

#[derive(Clone)]
pub struct AllocationManager {
    store: Arc<dyn InventoryStore>,
}

impl AllocationManager {
    pub fn new(store: Arc<dyn InventoryStore>) -> Self {
        Self { store }
    }

    /// Create a product from `quantity` units of warehouse row `batch_id`.
    ///
    /// The product's name defaults to the lot's product name.
    #[instrument(skip(self, attrs), fields(batch_id = %batch_id), err)]
    pub async fn create_product(&self, batch_id: BatchId, quantity: i64, attrs: ProductAttrs) -> DomainResult<Allocation> {
        if quantity <= 0 {
            return Err(DomainError::validation("quantity", "must be positive"));
        }

        let mut session = LedgerSession::open(self.store.as_ref()).await?;
        let mut source = take_from_warehouse(&mut session, batch_id, quantity).await?;

        let product = Product::create(ProductId::new(), attrs, source.product_name(), session.now())?;
        session.tx.insert_product(&product).await?;
        let line = session.carve(&mut source, quantity, product.id()).await?;

        let movements = session.commit().await?;
        info!(product_id = %product.id(), line = %line.id(), quantity, movements, "product created from warehouse stock");
        Ok(Allocation { product, line })
    }

    /// Bind `quantity` more units from warehouse row `batch_id` to an existing product.
    ///
    /// Stock from a lot the product already holds is added to that bound row.
    #[instrument(skip(self), fields(product_id = %product_id, batch_id = %batch_id), err)]
    pub async fn add_allocation(&self, product_id: ProductId, batch_id: BatchId, quantity: i64) -> DomainResult<Allocation> {
        if quantity <= 0 {
            return Err(DomainError::validation("quantity", "must be positive"));
        }

        let mut session = LedgerSession::open(self.store.as_ref()).await?;
        let product = require_active_product(&mut session, product_id).await?;
        let mut source = take_from_warehouse(&mut session, batch_id, quantity).await?;

        let key = source.merge_key();
        let existing = session
            .tx
            .lock_product_batches(product_id)
            .await?
            .into_iter()
            .find(|b| b.is_allocated_to(product_id) && b.merge_key() == key);

        let line = match existing {
            Some(mut line) => {
                session.adjust_quantity(&mut source, -quantity, AdjustReason::Allocation).await?;
                session.adjust_quantity(&mut line, quantity, AdjustReason::Allocation).await?;
                line
            }
            None => session.carve(&mut source, quantity, product_id).await?,
        };

        session.commit().await?;
        info!(line = %line.id(), quantity, "allocation added");
        Ok(Allocation { product, line })
    }

    /// Bring bound row `batch_id` of `product_id` to exactly `requested` units.
    #[instrument(skip(self), fields(product_id = %product_id, batch_id = %batch_id), err)]
    pub async fn resize_allocation(&self, product_id: ProductId, batch_id: BatchId, requested: i64) -> DomainResult<()> {
        let mut session = LedgerSession::open(self.store.as_ref()).await?;
        require_active_product(&mut session, product_id).await?;
        resize_line(&mut session, product_id, batch_id, requested).await?;
        session.commit().await?;
        Ok(())
    }

    /// Return every row bound to `product_id` to the warehouse.
    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub async fn release_all(&self, product_id: ProductId) -> DomainResult<usize> {
        let mut session = LedgerSession::open(self.store.as_ref()).await?;
        session
            .tx
            .lock_product(product_id)
            .await?
            .ok_or_else(|| DomainError::not_found("product", product_id))?;
        let released = release_all(&mut session, product_id).await?;
        session.commit().await?;
        info!(released, "product stock released to warehouse");
        Ok(released)
    }
}

pub(crate) async fn require_active_product(session: &mut LedgerSession, product_id: ProductId) -> DomainResult<Product> {
    let product = session
        .tx
        .lock_product(product_id)
        .await?
        .ok_or_else(|| DomainError::not_found("product", product_id))?;
    product.ensure_active()?;
    Ok(product)
}

/// Lock warehouse row `batch_id` and check it can give `quantity` units.
async fn take_from_warehouse(session: &mut LedgerSession, batch_id: BatchId, quantity: i64) -> DomainResult<Batch> {
    let source = session.require_batch(batch_id).await?;
    if !source.is_in_warehouse() {
        return Err(DomainError::conflict(format!(
            "batch {batch_id} is not in the warehouse"
        )));
    }
    if quantity > source.remaining_quantity() {
        warn!(%batch_id, quantity, available = source.remaining_quantity(), "allocation exceeds warehouse row");
        return Err(DomainError::insufficient_stock(quantity, source.remaining_quantity()));
    }
    Ok(source)
}

/// Resize one bound row inside an open session.
///
/// Growth draws from one warehouse row with the line's merge key; shrinking
/// and unbinding return stock to it. A shortage reports the most the line
/// could hold: its current quantity plus the largest such row.
pub(crate) async fn resize_line(
    session: &mut LedgerSession,
    product_id: ProductId,
    batch_id: BatchId,
    requested: i64,
) -> DomainResult<()> {
    let mut line = session.require_batch(batch_id).await?;
    if line.linked_product_id() != Some(product_id) {
        return Err(DomainError::not_found("allocation", batch_id));
    }

    let plan = plan_resize(&line, requested)?;
    debug!(%batch_id, requested, ?plan, "resize planned");

    match plan {
        ResizePlan::Unchanged => {}
        ResizePlan::Unbind { .. } => {
            session.unbind(line).await?;
        }
        ResizePlan::Shrink { release } => {
            session.return_to_warehouse(&mut line, release, AdjustReason::Resize).await?;
        }
        ResizePlan::Grow { need } => {
            let mut source = warehouse_source(session, &line, requested, need).await?;
            session.adjust_quantity(&mut source, -need, AdjustReason::Resize).await?;
            session.adjust_quantity(&mut line, need, AdjustReason::Resize).await?;
        }
        ResizePlan::Replenish { need } => {
            let mut source = warehouse_source(session, &line, requested, need).await?;
            session.carve(&mut source, need, product_id).await?;
        }
    }
    Ok(())
}

async fn warehouse_source(session: &mut LedgerSession, line: &Batch, requested: i64, need: i64) -> DomainResult<Batch> {
    let key = line.merge_key();
    if let Some(source) = session.find_warehouse_match(&WarehouseQuery::by_key(key.clone(), need)).await? {
        return Ok(source);
    }

    let in_warehouse = session.largest_warehouse_quantity(key).await?;
    let available = line.remaining_quantity() + in_warehouse;
    warn!(batch_id = %line.id(), requested, available, "resize exceeds available stock");
    Err(DomainError::insufficient_stock(requested, available))
}

/// Release every row linked to `product_id`. Returns how many rows were released.
pub(crate) async fn release_all(session: &mut LedgerSession, product_id: ProductId) -> DomainResult<usize> {
    let rows = session.tx.lock_product_batches(product_id).await?;
    let count = rows.len();
    for row in rows {
        session.release(row).await?;
    }
    Ok(count)
}
