//! Pure allocation decisions: which warehouse row to draw from or merge into,
//! and what a resize request means for a product-bound row.

use pharmastock_core::{DomainError, DomainResult, Entity};

use crate::batch::{Batch, BatchStatus, MergeKey};

/// Lookup for a warehouse row to reclaim stock from or fold stock into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseQuery {
    pub product_name: String,
    /// When set, every merge-key field must match exactly.
    pub key: Option<MergeKey>,
    pub min_quantity: i64,
}

impl WarehouseQuery {
    pub fn by_name(product_name: impl Into<String>, min_quantity: i64) -> Self {
        Self {
            product_name: product_name.into(),
            key: None,
            min_quantity,
        }
    }

    pub fn by_key(key: MergeKey, min_quantity: i64) -> Self {
        Self {
            product_name: key.product_name.clone(),
            key: Some(key),
            min_quantity,
        }
    }

    pub fn matches(&self, batch: &Batch) -> bool {
        batch.is_in_warehouse()
            && batch.product_name() == self.product_name
            && batch.remaining_quantity() >= self.min_quantity
            && self.key.as_ref().is_none_or(|k| *k == batch.merge_key())
    }
}

/// Pick the warehouse row a query resolves to.
///
/// Deterministic: earliest expiry first (no expiry last), then lowest id.
pub fn select_warehouse_match<'a>(
    candidates: impl IntoIterator<Item = &'a Batch>,
    query: &WarehouseQuery,
) -> Option<&'a Batch> {
    candidates
        .into_iter()
        .filter(|b| query.matches(b))
        .min_by(|a, b| a.fefo_cmp(b))
}

/// What a per-line resize request requires of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizePlan {
    /// Requested equals current (or zero on an already depleted row).
    Unchanged,
    /// Requested zero: return the whole row to the warehouse.
    Unbind { quantity: i64 },
    /// Requested below current: move `release` units back to the warehouse.
    Shrink { release: i64 },
    /// Requested above current: pull `need` units from a matching warehouse row.
    Grow { need: i64 },
    /// The bound row is depleted; carve a fresh bound row of `need` units.
    Replenish { need: i64 },
}

/// Decide how to bring `line` (a row bound to a product) to `requested` units.
pub fn plan_resize(line: &Batch, requested: i64) -> DomainResult<ResizePlan> {
    if requested < 0 {
        return Err(DomainError::validation("quantity", "cannot be negative"));
    }

    let current = line.remaining_quantity();
    match line.status() {
        BatchStatus::Unallocated => Err(DomainError::validation(
            "batch_id",
            format!("batch {} is not allocated to a product", line.id()),
        )),
        BatchStatus::Depleted if requested == 0 => Ok(ResizePlan::Unchanged),
        BatchStatus::Depleted => Ok(ResizePlan::Replenish { need: requested }),
        BatchStatus::Allocated => Ok(if requested == current {
            ResizePlan::Unchanged
        } else if requested == 0 {
            ResizePlan::Unbind { quantity: current }
        } else if requested < current {
            ResizePlan::Shrink {
                release: current - requested,
            }
        } else {
            ResizePlan::Grow {
                need: requested - current,
            }
        }),
    }
}
