//! Product catalog operations that touch stock.
//!
//! A product edit carries the full set of resize requests for the rows the
//! caller wants changed, each an absolute quantity. Attributes and every
//! resize commit together or not at all; errors name the request line that
//! caused them.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use pharmastock_core::{BatchId, DomainError, DomainResult, ProductId};
use pharmastock_inventory::Batch;
use pharmastock_products::{DeletionMode, Product, ProductAttrs, total_stock};

use crate::allocation::{release_all, require_active_product, resize_line};
use crate::ledger::LedgerSession;
use crate::store::InventoryStore;

/// Bring bound row `batch_id` to `quantity` units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub batch_id: BatchId,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductDetail {
    pub product: Product,
    pub batches: Vec<Batch>,
    pub total_stock: i64,
}

#[derive(Clone)]
pub struct ProductCatalog {
    store: Arc<dyn InventoryStore>,
}

impl ProductCatalog {
    pub fn new(store: Arc<dyn InventoryStore>) -> Self {
        Self { store }
    }

    pub async fn get_product(&self, product_id: ProductId) -> DomainResult<ProductDetail> {
        let product = self
            .store
            .product(product_id)
            .await?
            .ok_or_else(|| DomainError::not_found("product", product_id))?;
        let mut batches = self.store.product_batches(product_id).await?;
        batches.sort_by(|a, b| a.fefo_cmp(b));
        Ok(ProductDetail {
            total_stock: total_stock(product_id, &batches),
            product,
            batches,
        })
    }

    /// Edit attributes and resize bound rows in one transaction.
    #[instrument(skip(self, attrs, lines), fields(product_id = %product_id, lines = lines.len()), err)]
    pub async fn update_product(
        &self,
        product_id: ProductId,
        attrs: ProductAttrs,
        lines: Vec<ResizeRequest>,
    ) -> DomainResult<ProductDetail> {
        let mut seen = BTreeSet::new();
        for (index, line) in lines.iter().enumerate() {
            if !seen.insert(line.batch_id) {
                return Err(DomainError::validation(
                    "batch_id",
                    format!("batch {} requested twice", line.batch_id),
                )
                .at_line(index));
            }
            if line.quantity < 0 {
                return Err(DomainError::validation("quantity", "cannot be negative").at_line(index));
            }
        }

        let mut session = LedgerSession::open(self.store.as_ref()).await?;
        let mut product = require_active_product(&mut session, product_id).await?;
        product.update(attrs, session.now())?;
        session.tx.update_product(&product).await?;

        for (index, line) in lines.iter().enumerate() {
            resize_line(&mut session, product_id, line.batch_id, line.quantity)
                .await
                .map_err(|e| e.at_line(index))?;
        }

        let movements = session.commit().await?;
        info!(movements, "product updated");
        self.get_product(product_id).await
    }

    /// Release all stock, then soft-delete when sales reference the product,
    /// hard-delete otherwise.
    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub async fn delete_product(&self, product_id: ProductId) -> DomainResult<DeletionMode> {
        let mut session = LedgerSession::open(self.store.as_ref()).await?;
        let mut product = require_active_product(&mut session, product_id).await?;

        let released = release_all(&mut session, product_id).await?;
        let mode = DeletionMode::for_history(session.tx.product_has_sales(product_id).await?);
        match mode {
            DeletionMode::Soft => {
                product.mark_deleted(session.now());
                session.tx.update_product(&product).await?;
            }
            DeletionMode::Hard => session.tx.delete_product(product_id).await?,
        }

        session.commit().await?;
        info!(released, ?mode, "product deleted");
        Ok(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationManager;
    use crate::store::InMemoryInventoryStore;
    use pharmastock_core::{Entity, InvoiceId, LineId};
    use pharmastock_inventory::{BatchStatus, LotSpec};
    use pharmastock_purchasing::InvoiceLine;

    fn attrs(price: i64) -> ProductAttrs {
        ProductAttrs {
            name: Some("Omeprazole 20mg".to_string()),
            selling_price: price,
            margin_percent: Some(25.0),
            category_id: None,
            image_path: None,
        }
    }

    async fn setup(qty: i64) -> (Arc<InMemoryInventoryStore>, AllocationManager, ProductCatalog, Batch) {
        let store = Arc::new(InMemoryInventoryStore::new());
        let mut session = LedgerSession::open(store.as_ref()).await.unwrap();
        let line = InvoiceLine {
            line_id: LineId::new(),
            lot: LotSpec {
                product_name: "Omeprazole".to_string(),
                packaging_unit: "capsule".to_string(),
                unit_cost: 90,
                expiry_date: None,
            },
            quantity: qty,
        };
        let batch = session.receive(InvoiceId::new(), &line).await.unwrap();
        session.commit().await.unwrap();
        (
            store.clone(),
            AllocationManager::new(store.clone()),
            ProductCatalog::new(store),
            batch,
        )
    }

    #[tokio::test]
    async fn update_applies_attributes_and_resizes_together() {
        let (_, manager, catalog, batch) = setup(20).await;
        let created = manager.create_product(batch.id(), 5, attrs(300)).await.unwrap();

        let detail = catalog
            .update_product(
                created.product.id(),
                attrs(350),
                vec![ResizeRequest { batch_id: created.line.id(), quantity: 12 }],
            )
            .await
            .unwrap();

        assert_eq!(detail.product.selling_price(), 350);
        assert_eq!(detail.total_stock, 12);
    }

    #[tokio::test]
    async fn failing_line_rolls_back_attributes_and_names_the_line() {
        let (store, manager, catalog, batch) = setup(20).await;
        let created = manager.create_product(batch.id(), 5, attrs(300)).await.unwrap();

        let err = catalog
            .update_product(
                created.product.id(),
                attrs(999),
                vec![ResizeRequest { batch_id: created.line.id(), quantity: 26 }],
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DomainError::InsufficientStock { line: Some(0), requested: 26, available: 20 }
        );
        let product = store.product(created.product.id()).await.unwrap().unwrap();
        assert_eq!(product.selling_price(), 300);
        assert_eq!(store.batch(batch.id()).await.unwrap().unwrap().remaining_quantity(), 15);
    }

    #[tokio::test]
    async fn duplicate_rows_in_one_update_are_rejected() {
        let (_, manager, catalog, batch) = setup(20).await;
        let created = manager.create_product(batch.id(), 5, attrs(300)).await.unwrap();
        let request = ResizeRequest { batch_id: created.line.id(), quantity: 4 };

        let err = catalog
            .update_product(created.product.id(), attrs(300), vec![request, request])
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation { ref field, .. } if field == "lines[1].batch_id"));
    }

    #[tokio::test]
    async fn unsold_product_is_hard_deleted_and_its_stock_returned() {
        let (store, manager, catalog, batch) = setup(20).await;
        let created = manager.create_product(batch.id(), 5, attrs(300)).await.unwrap();

        assert_eq!(catalog.delete_product(created.product.id()).await.unwrap(), DeletionMode::Hard);
        assert!(store.product(created.product.id()).await.unwrap().is_none());
        let row = store.batch(created.line.id()).await.unwrap().unwrap();
        assert_eq!((row.status(), row.remaining_quantity()), (BatchStatus::Unallocated, 5));
        assert!(row.linked_product_id().is_none());
        assert_eq!(store.batch(batch.id()).await.unwrap().unwrap().remaining_quantity(), 15);
    }

    #[tokio::test]
    async fn deleted_product_refuses_further_edits() {
        let (store, manager, catalog, batch) = setup(20).await;
        let created = manager.create_product(batch.id(), 5, attrs(300)).await.unwrap();
        catalog.delete_product(created.product.id()).await.unwrap();

        assert!(matches!(
            catalog.update_product(created.product.id(), attrs(1), vec![]).await,
            Err(DomainError::NotFound { .. })
        ));
        assert!(store.product_batches(created.product.id()).await.unwrap().is_empty());
    }
}
