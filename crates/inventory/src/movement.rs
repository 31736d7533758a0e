use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pharmastock_core::{BatchId, InvoiceId, LineId, ProductId};
use pharmastock_events::Event;

/// Stream type of every batch journal.
pub const BATCH_STREAM: &str = "inventory.batch";

/// Why a quantity changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustReason {
    Allocation,
    Resize,
    Sale,
    Merge,
    InvoiceEdit,
}

/// Event: a lot arrived from a purchase invoice line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReceived {
    pub batch_id: BatchId,
    pub invoice_id: InvoiceId,
    pub line_id: LineId,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a new row was split off `source_id`.
///
/// `product_id` is `None` when the split row stays in the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSplit {
    pub batch_id: BatchId,
    pub source_id: Option<BatchId>,
    pub product_id: Option<ProductId>,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: quantity changed in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityAdjusted {
    pub batch_id: BatchId,
    pub delta: i64,
    pub reason: AdjustReason,
    pub occurred_at: DateTime<Utc>,
}

/// Event: the row was released from its product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUnlinked {
    pub batch_id: BatchId,
    pub product_id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: the row's whole quantity was folded into `into` and the row removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMerged {
    pub batch_id: BatchId,
    pub into: BatchId,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: the row was deleted with its invoice (or invoice line).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDeleted {
    pub batch_id: BatchId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockMovement {
    Received(BatchReceived),
    Split(BatchSplit),
    Adjusted(QuantityAdjusted),
    Unlinked(BatchUnlinked),
    Merged(BatchMerged),
    Deleted(BatchDeleted),
}

impl StockMovement {
    /// The batch journal this movement is appended to.
    pub fn batch_id(&self) -> BatchId {
        match self {
            StockMovement::Received(e) => e.batch_id,
            StockMovement::Split(e) => e.batch_id,
            StockMovement::Adjusted(e) => e.batch_id,
            StockMovement::Unlinked(e) => e.batch_id,
            StockMovement::Merged(e) => e.batch_id,
            StockMovement::Deleted(e) => e.batch_id,
        }
    }

    /// Net change in the stream's physical quantity.
    pub fn quantity_delta(&self) -> i64 {
        match self {
            StockMovement::Received(e) => e.quantity,
            StockMovement::Split(e) => e.quantity,
            StockMovement::Adjusted(e) => e.delta,
            StockMovement::Merged(e) => -e.quantity,
            StockMovement::Unlinked(_) | StockMovement::Deleted(_) => 0,
        }
    }
}

impl Event for StockMovement {
    const STREAM_TYPE: &'static str = BATCH_STREAM;

    fn stream_id(&self) -> Uuid {
        *self.batch_id().as_uuid()
    }

    fn event_type(&self) -> &'static str {
        match self {
            StockMovement::Received(_) => "inventory.batch.received",
            StockMovement::Split(_) => "inventory.batch.split",
            StockMovement::Adjusted(_) => "inventory.batch.adjusted",
            StockMovement::Unlinked(_) => "inventory.batch.unlinked",
            StockMovement::Merged(_) => "inventory.batch.merged",
            StockMovement::Deleted(_) => "inventory.batch.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockMovement::Received(e) => e.occurred_at,
            StockMovement::Split(e) => e.occurred_at,
            StockMovement::Adjusted(e) => e.occurred_at,
            StockMovement::Unlinked(e) => e.occurred_at,
            StockMovement::Merged(e) => e.occurred_at,
            StockMovement::Deleted(e) => e.occurred_at,
        }
    }
}
