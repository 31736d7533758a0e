//! Batch ledger domain module.
//!
//! Lots received from purchase invoices, their explicit allocation state, and
//! the pure decisions (warehouse matching, resize planning) the allocation
//! engine executes. No IO, no storage.

pub mod allocation;
pub mod batch;
pub mod movement;

pub use allocation::{ResizePlan, WarehouseQuery, plan_resize, select_warehouse_match};
pub use batch::{Batch, BatchParts, BatchState, BatchStatus, LotSpec, MergeKey};
pub use movement::{
    AdjustReason, BATCH_STREAM, BatchDeleted, BatchMerged, BatchReceived, BatchSplit,
    BatchUnlinked, QuantityAdjusted, StockMovement,
};
