//! First-Expire-First-Out consumption planning.

use serde::{Deserialize, Serialize};

use pharmastock_core::{BatchId, DomainError, DomainResult, Entity, ProductId};
use pharmastock_inventory::Batch;

/// Take `quantity` units from `batch_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deduction {
    pub batch_id: BatchId,
    pub quantity: i64,
}

/// Sellable quantity of `product_id` among `batches`.
pub fn available_for<'a>(product_id: ProductId, batches: impl IntoIterator<Item = &'a Batch>) -> i64 {
    batches
        .into_iter()
        .filter(|b| b.is_allocated_to(product_id))
        .map(Batch::remaining_quantity)
        .sum()
}

/// Plan how to take `quantity` units of `product_id`, soonest expiry first.
///
/// Only rows currently allocated to the product are eligible. The plan draws
/// exactly `quantity` units or fails with `InsufficientStock` carrying the
/// available total.
pub fn plan_consumption(
    product_id: ProductId,
    batches: &[Batch],
    quantity: i64,
) -> DomainResult<Vec<Deduction>> {
    if quantity <= 0 {
        return Err(DomainError::validation("quantity", "must be positive"));
    }

    let mut eligible: Vec<&Batch> = batches.iter().filter(|b| b.is_allocated_to(product_id)).collect();
    let available: i64 = eligible.iter().map(|b| b.remaining_quantity()).sum();
    if available < quantity {
        return Err(DomainError::insufficient_stock(quantity, available));
    }

    eligible.sort_by(|a, b| a.fefo_cmp(b));

    let mut needed = quantity;
    let mut plan = Vec::new();
    for batch in eligible {
        if needed == 0 {
            break;
        }
        let take = needed.min(batch.remaining_quantity());
        plan.push(Deduction {
            batch_id: batch.id(),
            quantity: take,
        });
        needed -= take;
    }

    Ok(plan)
}
