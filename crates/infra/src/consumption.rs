//! Sale consumption: FEFO deduction of product stock at the point of sale.
//!
//! Availability is checked again inside the transaction, against locked
//! rows, so two tills selling the last units race on the row locks and the
//! loser gets `InsufficientStock` instead of a negative quantity. A sale with
//! several lines deducts all of them or none.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use pharmastock_core::{DomainError, DomainResult, Entity, ProductId, SaleId, UserId};
use pharmastock_inventory::AdjustReason;
use pharmastock_products::Product;
use pharmastock_sales::{
    Deduction, PaymentMethod, SaleRequestLine, SaleTransaction, available_for, merge_lines,
    plan_consumption,
};

use crate::allocation::require_active_product;
use crate::ledger::LedgerSession;
use crate::store::InventoryStore;

/// Read-only availability answer for a till.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub product_id: ProductId,
    pub requested: i64,
    pub available: i64,
    pub sufficient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRequest {
    pub cashier_id: UserId,
    pub payment_method: PaymentMethod,
    pub amount_paid: i64,
    pub lines: Vec<SaleRequestLine>,
}

#[derive(Clone)]
pub struct SaleEngine {
    store: Arc<dyn InventoryStore>,
}

impl SaleEngine {
    pub fn new(store: Arc<dyn InventoryStore>) -> Self {
        Self { store }
    }

    /// How much of `product_id` could be sold right now. Takes no locks.
    pub async fn quote(&self, product_id: ProductId, quantity: i64) -> DomainResult<Quote> {
        if quantity <= 0 {
            return Err(DomainError::validation("quantity", "must be positive"));
        }
        self.store
            .product(product_id)
            .await?
            .ok_or_else(|| DomainError::not_found("product", product_id))?
            .ensure_active()?;

        let batches = self.store.product_batches(product_id).await?;
        let available = available_for(product_id, &batches);
        Ok(Quote {
            product_id,
            requested: quantity,
            available,
            sufficient: available >= quantity,
        })
    }

    /// Record a multi-line sale and deduct its stock in one transaction.
    ///
    /// This is the only path that takes stock out of a product, so every
    /// deducted unit is backed by a sale line. Lines for the same product are
    /// folded into one, and each is deducted soonest expiry first. Each line is priced at
    /// its override or the product's current selling price.
    #[instrument(skip(self, request), fields(cashier_id = %request.cashier_id, lines = request.lines.len()), err)]
    pub async fn record_sale(&self, request: SaleRequest) -> DomainResult<SaleTransaction> {
        let merged = merge_lines(&request.lines)?;

        let mut session = LedgerSession::open(self.store.as_ref()).await?;

        // Lock products in id order so concurrent sales queue instead of deadlocking.
        let mut products: BTreeMap<ProductId, Product> = BTreeMap::new();
        let mut order: Vec<_> = merged.iter().map(|m| (m.product_id, m.index)).collect();
        order.sort();
        for (product_id, index) in order {
            let product = require_active_product(&mut session, product_id)
                .await
                .map_err(|e| e.at_line(index))?;
            products.insert(product_id, product);
        }

        let mut items = Vec::with_capacity(merged.len());
        for line in merged {
            deduct(&mut session, line.product_id, line.quantity)
                .await
                .map_err(|e| e.at_line(line.index))?;
            let selling_price = products
                .get(&line.product_id)
                .map(Product::selling_price)
                .ok_or_else(|| DomainError::not_found("product", line.product_id))?;
            items.push(line.priced(selling_price));
        }

        let sale = SaleTransaction::record(
            SaleId::new(),
            request.cashier_id,
            request.payment_method,
            request.amount_paid,
            items,
            session.now(),
        )?;
        session.tx.insert_sale(&sale).await?;

        session.commit().await?;
        info!(sale_id = %sale.id(), total = sale.total_price(), "sale recorded");
        Ok(sale)
    }

    pub async fn get_sale(&self, sale_id: SaleId) -> DomainResult<SaleTransaction> {
        self.store
            .sale(sale_id)
            .await?
            .ok_or_else(|| DomainError::not_found("sale", sale_id))
    }
}

/// Lock the product's rows, plan FEFO and apply the deductions.
async fn deduct(session: &mut LedgerSession, product_id: ProductId, quantity: i64) -> DomainResult<Vec<Deduction>> {
    let mut rows = session.tx.lock_product_batches(product_id).await?;
    let plan = plan_consumption(product_id, &rows, quantity).inspect_err(|e| {
        if let DomainError::InsufficientStock { available, .. } = e {
            warn!(%product_id, quantity, available, "sale exceeds product stock");
        }
    })?;

    for step in &plan {
        let row = rows
            .iter_mut()
            .find(|b| b.id() == step.batch_id)
            .ok_or_else(|| DomainError::not_found("batch", step.batch_id))?;
        session.adjust_quantity(row, -step.quantity, AdjustReason::Sale).await?;
        debug!(batch_id = %step.batch_id, taken = step.quantity, "deducted");
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationManager;
    use crate::catalog::ProductCatalog;
    use crate::store::InMemoryInventoryStore;
    use chrono::NaiveDate;
    use pharmastock_core::{InvoiceId, LineId};
    use pharmastock_inventory::{Batch, BatchStatus, LotSpec};
    use pharmastock_products::{DeletionMode, ProductAttrs, ProductStatus};
    use pharmastock_purchasing::InvoiceLine;

    struct Fixture {
        store: Arc<InMemoryInventoryStore>,
        manager: AllocationManager,
        engine: SaleEngine,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryInventoryStore::new());
            Self {
                manager: AllocationManager::new(store.clone()),
                engine: SaleEngine::new(store.clone()),
                store,
            }
        }

        async fn lot(&self, qty: i64, expiry: Option<NaiveDate>) -> Batch {
            let mut session = LedgerSession::open(self.store.as_ref()).await.unwrap();
            let line = InvoiceLine {
                line_id: LineId::new(),
                lot: LotSpec {
                    product_name: "Metformin".to_string(),
                    packaging_unit: "box".to_string(),
                    unit_cost: 600,
                    expiry_date: expiry,
                },
                quantity: qty,
            };
            let batch = session.receive(InvoiceId::new(), &line).await.unwrap();
            session.commit().await.unwrap();
            batch
        }

        async fn product(&self, from: &Batch, qty: i64, price: i64) -> ProductId {
            let attrs = ProductAttrs {
                name: Some("Metformin 850".to_string()),
                selling_price: price,
                margin_percent: None,
                category_id: None,
                image_path: None,
            };
            self.manager.create_product(from.id(), qty, attrs).await.unwrap().product.id()
        }
    }

    fn line(product_id: ProductId, quantity: i64) -> SaleRequestLine {
        SaleRequestLine { product_id, quantity, unit_price: None }
    }

    #[tokio::test]
    async fn quote_is_read_only_and_repeatable() {
        let fx = Fixture::new();
        let lot = fx.lot(10, None).await;
        let product = fx.product(&lot, 6, 100).await;

        let first = fx.engine.quote(product, 8).await.unwrap();
        let second = fx.engine.quote(product, 8).await.unwrap();
        assert_eq!(first, second);
        assert_eq!((first.available, first.sufficient), (6, false));
        assert_eq!(fx.store.product_batches(product).await.unwrap()[0].remaining_quantity(), 6);
    }

    #[tokio::test]
    async fn sale_spans_lots_and_records_one_line() {
        let fx = Fixture::new();
        let early = fx.lot(5, NaiveDate::from_ymd_opt(2025, 1, 1)).await;
        let late = fx.lot(5, NaiveDate::from_ymd_opt(2025, 6, 1)).await;
        let product = fx.product(&early, 5, 200).await;
        fx.manager.add_allocation(product, late.id(), 5).await.unwrap();

        let sale = fx
            .engine
            .record_sale(SaleRequest {
                cashier_id: UserId::new(),
                payment_method: PaymentMethod::Cash,
                amount_paid: 2000,
                lines: vec![line(product, 4), line(product, 3)],
            })
            .await
            .unwrap();

        assert_eq!(sale.lines().len(), 1);
        assert_eq!(sale.lines()[0].quantity, 7);
        assert_eq!(sale.total_price(), 1400);
        assert_eq!(sale.change_due(), 600);
        assert_eq!(fx.engine.get_sale(sale.id()).await.unwrap(), sale);
    }

    #[tokio::test]
    async fn one_short_line_aborts_the_whole_sale() {
        let fx = Fixture::new();
        let lot = fx.lot(20, None).await;
        let plenty = fx.product(&lot, 10, 100).await;
        let scarce = fx.product(&lot, 2, 100).await;

        let err = fx
            .engine
            .record_sale(SaleRequest {
                cashier_id: UserId::new(),
                payment_method: PaymentMethod::Card,
                amount_paid: 10_000,
                lines: vec![line(plenty, 5), line(scarce, 3)],
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DomainError::InsufficientStock { line: Some(1), requested: 3, available: 2 }
        );
        assert_eq!(fx.engine.quote(plenty, 1).await.unwrap().available, 10);
    }

    #[tokio::test]
    async fn underpaid_sale_leaves_stock_untouched() {
        let fx = Fixture::new();
        let lot = fx.lot(10, None).await;
        let product = fx.product(&lot, 10, 500).await;

        let err = fx
            .engine
            .record_sale(SaleRequest {
                cashier_id: UserId::new(),
                payment_method: PaymentMethod::Cash,
                amount_paid: 999,
                lines: vec![line(product, 2)],
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Validation { ref field, .. } if field == "amount_paid"));
        assert_eq!(fx.engine.quote(product, 1).await.unwrap().available, 10);
    }

    #[tokio::test]
    async fn sold_out_product_is_soft_deleted_and_unsellable() {
        let fx = Fixture::new();
        let lot = fx.lot(10, None).await;
        let product = fx.product(&lot, 4, 100).await;
        let sale = fx
            .engine
            .record_sale(SaleRequest {
                cashier_id: UserId::new(),
                payment_method: PaymentMethod::Cash,
                amount_paid: 400,
                lines: vec![line(product, 4)],
            })
            .await
            .unwrap();
        assert_eq!(sale.lines()[0].quantity, 4);

        let depleted = fx.store.product_batches(product).await.unwrap();
        assert_eq!(depleted[0].status(), BatchStatus::Depleted);
        let err = fx
            .engine
            .record_sale(SaleRequest {
                cashier_id: UserId::new(),
                payment_method: PaymentMethod::Transfer,
                amount_paid: 0,
                lines: vec![line(product, 1)],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock { available: 0, .. }));

        let catalog = ProductCatalog::new(fx.store.clone());
        assert_eq!(catalog.delete_product(product).await.unwrap(), DeletionMode::Soft);
        let kept = fx.store.product(product).await.unwrap().unwrap();
        assert_eq!(kept.status(), ProductStatus::Deleted);
        assert!(fx.store.product_batches(product).await.unwrap().is_empty());

        assert!(matches!(
            fx.engine.quote(product, 1).await,
            Err(DomainError::NotFound { .. })
        ));
        assert!(matches!(
            fx.engine
                .record_sale(SaleRequest {
                    cashier_id: UserId::new(),
                    payment_method: PaymentMethod::Cash,
                    amount_paid: 100,
                    lines: vec![line(product, 1)],
                })
                .await,
            Err(DomainError::NotFound { .. })
        ));
    }
}
