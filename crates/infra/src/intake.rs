//! Purchase intake: invoices and the warehouse rows their lines create.
//!
//! Invoice edits are diffed by line id instead of replacing every line, so
//! rows already bound to products keep their binding and history:
//!
//! - a line nothing was taken from (no bound rows, nothing sold) is rewritten
//!   in place, attributes and quantity
//! - a line with bound or sold descendants keeps its lot attributes; its
//!   quantity can still move by the edit's delta through its warehouse row
//! - a removed line must be whole and unbound, and its rows are deleted
//! - new lines are received like on a fresh invoice

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, instrument};

use pharmastock_core::{DomainError, DomainResult, Entity, InvoiceId};
use pharmastock_inventory::{AdjustReason, Batch};
use pharmastock_purchasing::{
    IntakePolicy, InvoiceHeader, InvoiceLine, InvoiceLineInput, LineChange, PurchaseInvoice,
};

use crate::ledger::LedgerSession;
use crate::store::InventoryStore;

/// An invoice with every batch row descended from it.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDetail {
    pub invoice: PurchaseInvoice,
    pub batches: Vec<Batch>,
}

#[derive(Clone)]
pub struct PurchaseIntake {
    store: Arc<dyn InventoryStore>,
    policy: IntakePolicy,
}

impl PurchaseIntake {
    pub fn new(store: Arc<dyn InventoryStore>, policy: IntakePolicy) -> Self {
        Self { store, policy }
    }

    /// Record an invoice and create one warehouse row per line, all or nothing.
    #[instrument(skip(self, header, lines), fields(invoice_number = %header.invoice_number, lines = lines.len()), err)]
    pub async fn receive(&self, header: InvoiceHeader, lines: Vec<InvoiceLineInput>) -> DomainResult<InvoiceDetail> {
        let mut session = LedgerSession::open(self.store.as_ref()).await?;
        let invoice = PurchaseInvoice::receive(InvoiceId::new(), header, &lines, &self.policy, session.now())?;

        ensure_number_free(&mut session, &invoice, None).await?;
        session.tx.insert_invoice(&invoice).await?;

        let mut batches = Vec::with_capacity(invoice.lines().len());
        for line in invoice.lines() {
            batches.push(session.receive(invoice.id(), line).await?);
        }

        session.commit().await?;
        info!(invoice_id = %invoice.id(), total = invoice.total(), "invoice received");
        Ok(InvoiceDetail { invoice, batches })
    }

    pub async fn get(&self, invoice_id: InvoiceId) -> DomainResult<InvoiceDetail> {
        let invoice = self
            .store
            .invoice(invoice_id)
            .await?
            .ok_or_else(|| DomainError::not_found("invoice", invoice_id))?;
        let batches = self.store.invoice_batches(invoice_id).await?;
        Ok(InvoiceDetail { invoice, batches })
    }

    /// Apply a revised header and line set.
    #[instrument(skip(self, header, lines), fields(invoice_id = %invoice_id), err)]
    pub async fn update(
        &self,
        invoice_id: InvoiceId,
        header: InvoiceHeader,
        lines: Vec<InvoiceLineInput>,
    ) -> DomainResult<InvoiceDetail> {
        let mut session = LedgerSession::open(self.store.as_ref()).await?;
        let mut invoice = lock_invoice(&mut session, invoice_id).await?;
        let diff = invoice.revise(header, &lines, &self.policy, session.now())?;
        ensure_number_free(&mut session, &invoice, Some(invoice_id)).await?;

        for removed in &diff.removed {
            remove_line(&mut session, invoice_id, removed).await?;
        }
        for change in &diff.updated {
            revise_line(&mut session, invoice_id, change)
                .await
                .map_err(|e| e.at_line(change.index))?;
        }
        for added in &diff.added {
            session.receive(invoice_id, added).await?;
        }

        session.tx.update_invoice(&invoice).await?;
        session.commit().await?;
        info!(
            updated = diff.updated.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "invoice updated"
        );

        let batches = self.store.invoice_batches(invoice_id).await?;
        Ok(InvoiceDetail { invoice, batches })
    }

    /// Delete an invoice and all of its rows. Any row still bound to a product blocks it.
    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    pub async fn delete(&self, invoice_id: InvoiceId) -> DomainResult<()> {
        let mut session = LedgerSession::open(self.store.as_ref()).await?;
        lock_invoice(&mut session, invoice_id).await?;

        let rows = session.tx.lock_invoice_batches(invoice_id).await?;
        if let Some(bound) = rows.iter().find(|b| b.linked_product_id().is_some()) {
            return Err(DomainError::conflict(format!(
                "invoice {invoice_id} has stock bound to product {}",
                bound.linked_product_id().map(|p| p.to_string()).unwrap_or_default()
            )));
        }
        for row in &rows {
            session.delete_batch(row).await?;
        }
        session.tx.delete_invoice(invoice_id).await?;

        session.commit().await?;
        info!(rows = rows.len(), "invoice deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    pub async fn mark_paid(&self, invoice_id: InvoiceId, payment_date: NaiveDate) -> DomainResult<PurchaseInvoice> {
        let mut session = LedgerSession::open(self.store.as_ref()).await?;
        let mut invoice = lock_invoice(&mut session, invoice_id).await?;
        invoice.mark_paid(payment_date, session.now())?;
        session.tx.update_invoice(&invoice).await?;
        session.commit().await?;
        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    pub async fn mark_unpaid(&self, invoice_id: InvoiceId) -> DomainResult<PurchaseInvoice> {
        let mut session = LedgerSession::open(self.store.as_ref()).await?;
        let mut invoice = lock_invoice(&mut session, invoice_id).await?;
        invoice.mark_unpaid(session.now());
        session.tx.update_invoice(&invoice).await?;
        session.commit().await?;
        Ok(invoice)
    }
}

async fn lock_invoice(session: &mut LedgerSession, invoice_id: InvoiceId) -> DomainResult<PurchaseInvoice> {
    session
        .tx
        .lock_invoice(invoice_id)
        .await?
        .ok_or_else(|| DomainError::not_found("invoice", invoice_id))
}

async fn ensure_number_free(
    session: &mut LedgerSession,
    invoice: &PurchaseInvoice,
    except: Option<InvoiceId>,
) -> DomainResult<()> {
    if session.tx.invoice_number_taken(invoice.invoice_number(), except).await? {
        return Err(DomainError::conflict(format!(
            "invoice number '{}' is already recorded",
            invoice.invoice_number()
        )));
    }
    Ok(())
}

/// Nothing bound to a product and nothing sold.
fn is_untouched(rows: &[Batch], received: i64) -> bool {
    rows.iter().all(|b| b.linked_product_id().is_none())
        && rows.iter().map(Batch::remaining_quantity).sum::<i64>() == received
}

async fn remove_line(session: &mut LedgerSession, invoice_id: InvoiceId, line: &InvoiceLine) -> DomainResult<()> {
    let rows = session.tx.lock_line_batches(invoice_id, line.line_id).await?;
    if !is_untouched(&rows, line.quantity) {
        return Err(DomainError::conflict(format!(
            "line {} has stock bound to a product or already sold",
            line.line_id
        )));
    }
    for row in &rows {
        session.delete_batch(row).await?;
    }
    Ok(())
}

async fn revise_line(session: &mut LedgerSession, invoice_id: InvoiceId, change: &LineChange) -> DomainResult<()> {
    let mut rows = session
        .tx
        .lock_line_batches(invoice_id, change.previous.line_id)
        .await?;
    let untouched = is_untouched(&rows, change.previous.quantity);

    if change.lot_changed() {
        if !untouched {
            return Err(DomainError::conflict(format!(
                "line {} has stock bound to a product or already sold; only its quantity can change",
                change.previous.line_id
            )));
        }
        for row in &mut rows {
            row.relabel(change.next.lot.clone(), session.now())?;
            session.tx.update_batch(row).await?;
        }
    }

    let delta = change.quantity_delta();
    if delta > 0 {
        let Some(template) = rows.first() else {
            return Err(DomainError::storage(format!(
                "line {} has no batch rows",
                change.previous.line_id
            )));
        };
        let template = template.clone();
        session.stock_warehouse(&template, delta, AdjustReason::InvoiceEdit).await?;
    } else if delta < 0 {
        let Some(row) = rows.iter_mut().find(|b| b.is_in_warehouse()) else {
            return Err(DomainError::validation(
                "quantity",
                "no warehouse stock left on this line to remove",
            ));
        };
        if row.remaining_quantity() < -delta {
            return Err(DomainError::validation(
                "quantity",
                format!(
                    "only {} units of this line are still in the warehouse",
                    row.remaining_quantity()
                ),
            ));
        }
        session.adjust_quantity(row, delta, AdjustReason::InvoiceEdit).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationManager;
    use crate::store::InMemoryInventoryStore;
    use pharmastock_inventory::BatchStatus;
    use pharmastock_products::ProductAttrs;
    use pharmastock_purchasing::PaymentStatus;

    fn header(number: &str) -> InvoiceHeader {
        InvoiceHeader {
            invoice_number: number.to_string(),
            supplier_id: None,
            invoice_date: NaiveDate::from_ymd_opt(2026, 1, 10).unwrap(),
            due_date: None,
            payment_date: None,
        }
    }

    fn input(name: &str, qty: i64) -> InvoiceLineInput {
        InvoiceLineInput {
            line_id: None,
            product_name: name.to_string(),
            quantity: qty,
            packaging_unit: "box".to_string(),
            unit_cost: 800,
            expiry_date: NaiveDate::from_ymd_opt(2027, 5, 31),
        }
    }

    fn resubmit(line: &InvoiceLine, qty: i64) -> InvoiceLineInput {
        InvoiceLineInput {
            line_id: Some(line.line_id),
            product_name: line.lot.product_name.clone(),
            quantity: qty,
            packaging_unit: line.lot.packaging_unit.clone(),
            unit_cost: line.lot.unit_cost,
            expiry_date: line.lot.expiry_date,
        }
    }

    fn attrs() -> ProductAttrs {
        ProductAttrs {
            name: None,
            selling_price: 1200,
            margin_percent: None,
            category_id: None,
            image_path: None,
        }
    }

    fn setup() -> (Arc<InMemoryInventoryStore>, PurchaseIntake) {
        let store = Arc::new(InMemoryInventoryStore::new());
        let intake = PurchaseIntake::new(store.clone(), IntakePolicy::default());
        (store, intake)
    }

    #[tokio::test]
    async fn receive_creates_one_warehouse_row_per_line() {
        let (_, intake) = setup();
        let detail = intake
            .receive(header("INV-7"), vec![input("Cetirizine", 30), input("Loratadine", 12)])
            .await
            .unwrap();

        assert_eq!(detail.batches.len(), 2);
        assert!(detail.batches.iter().all(Batch::is_in_warehouse));
        assert_eq!(detail.invoice.total(), 42 * 800);
        assert_eq!(detail.invoice.payment_status(), PaymentStatus::Unpaid);
    }

    #[tokio::test]
    async fn invalid_line_rejects_the_whole_invoice() {
        let (store, intake) = setup();
        let err = intake
            .receive(header("INV-8"), vec![input("Cetirizine", 30), input("Loratadine", 0)])
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Validation { ref field, .. } if field == "lines[1].quantity"));
        assert!(store.warehouse_batches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_invoice_number_is_a_conflict() {
        let (_, intake) = setup();
        intake.receive(header("INV-9"), vec![input("Cetirizine", 1)]).await.unwrap();
        let err = intake
            .receive(header("INV-9"), vec![input("Cetirizine", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict { retryable: false, .. }));
    }

    #[tokio::test]
    async fn untouched_line_is_rewritten_in_place() {
        let (store, intake) = setup();
        let detail = intake.receive(header("INV-10"), vec![input("Cetirizine", 30)]).await.unwrap();
        let line = detail.invoice.lines()[0].clone();

        let mut edited = resubmit(&line, 25);
        edited.unit_cost = 750;
        let updated = intake.update(detail.invoice.id(), header("INV-10"), vec![edited]).await.unwrap();

        assert_eq!(updated.batches.len(), 1);
        let row = &updated.batches[0];
        assert_eq!(row.id(), detail.batches[0].id());
        assert_eq!(row.remaining_quantity(), 25);
        assert_eq!(row.lot().unit_cost, 750);
        assert_eq!(updated.invoice.total(), 25 * 750);
        assert_eq!(store.movements(row.id()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn allocated_line_keeps_its_lot_but_quantity_can_move() {
        let (store, intake) = setup();
        let detail = intake.receive(header("INV-11"), vec![input("Cetirizine", 30)]).await.unwrap();
        let line = detail.invoice.lines()[0].clone();
        let manager = AllocationManager::new(store.clone());
        let created = manager.create_product(detail.batches[0].id(), 20, attrs()).await.unwrap();

        let mut relabelled = resubmit(&line, 30);
        relabelled.product_name = "Cetirizine 10mg".to_string();
        let err = intake
            .update(detail.invoice.id(), header("INV-11"), vec![relabelled])
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict { .. }));

        let err = intake
            .update(detail.invoice.id(), header("INV-11"), vec![resubmit(&line, 5)])
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation { ref field, .. } if field == "lines[0].quantity"));

        let updated = intake
            .update(detail.invoice.id(), header("INV-11"), vec![resubmit(&line, 36)])
            .await
            .unwrap();
        let warehouse: i64 = updated
            .batches
            .iter()
            .filter(|b| b.is_in_warehouse())
            .map(Batch::remaining_quantity)
            .sum();
        assert_eq!(warehouse, 16);
        assert_eq!(store.batch(created.line.id()).await.unwrap().unwrap().remaining_quantity(), 20);
    }

    #[tokio::test]
    async fn removing_and_adding_lines() {
        let (store, intake) = setup();
        let detail = intake
            .receive(header("INV-12"), vec![input("Cetirizine", 30), input("Loratadine", 10)])
            .await
            .unwrap();
        let keep = detail.invoice.lines()[0].clone();

        let updated = intake
            .update(
                detail.invoice.id(),
                header("INV-12"),
                vec![resubmit(&keep, 30), input("Fexofenadine", 4)],
            )
            .await
            .unwrap();

        let names: Vec<&str> = updated.batches.iter().map(Batch::product_name).collect();
        assert_eq!(updated.batches.len(), 2);
        assert!(names.contains(&"Fexofenadine"));
        assert!(!names.contains(&"Loratadine"));
        assert!(store.batch(detail.batches[1].id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_edit_names_its_submitted_position() {
        let (store, intake) = setup();
        let detail = intake
            .receive(header("INV-16"), vec![input("Cetirizine", 30), input("Loratadine", 10)])
            .await
            .unwrap();
        let (cetirizine, loratadine) = (detail.invoice.lines()[0].clone(), detail.invoice.lines()[1].clone());
        let source = detail
            .batches
            .iter()
            .find(|b| b.product_name() == "Loratadine")
            .unwrap();
        AllocationManager::new(store.clone())
            .create_product(source.id(), 8, attrs())
            .await
            .unwrap();

        let err = intake
            .update(
                detail.invoice.id(),
                header("INV-16"),
                vec![input("Fexofenadine", 4), resubmit(&cetirizine, 30), resubmit(&loratadine, 5)],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Validation { ref field, .. } if field == "lines[2].quantity"));
        assert_eq!(store.invoice_batches(detail.invoice.id()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_line_id_is_a_validation_error() {
        let (_, intake) = setup();
        let detail = intake.receive(header("INV-13"), vec![input("Cetirizine", 3)]).await.unwrap();
        let mut stranger = input("Cetirizine", 3);
        stranger.line_id = Some(pharmastock_core::LineId::new());

        let err = intake
            .update(detail.invoice.id(), header("INV-13"), vec![stranger])
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation { ref field, .. } if field == "lines[0].line_id"));
    }

    #[tokio::test]
    async fn delete_blocked_until_stock_is_released() {
        let (store, intake) = setup();
        let detail = intake.receive(header("INV-14"), vec![input("Cetirizine", 30)]).await.unwrap();
        let manager = AllocationManager::new(store.clone());
        let created = manager.create_product(detail.batches[0].id(), 30, attrs()).await.unwrap();

        let err = intake.delete(detail.invoice.id()).await.unwrap_err();
        assert!(matches!(err, DomainError::Conflict { retryable: false, .. }));

        manager.release_all(created.product.id()).await.unwrap();
        intake.delete(detail.invoice.id()).await.unwrap();

        assert!(store.invoice_batches(detail.invoice.id()).await.unwrap().is_empty());
        assert!(matches!(
            intake.get(detail.invoice.id()).await,
            Err(DomainError::NotFound { entity: "invoice", .. })
        ));
    }

    #[tokio::test]
    async fn payment_status_follows_payment_date() {
        let (_, intake) = setup();
        let detail = intake.receive(header("INV-15"), vec![input("Cetirizine", 3)]).await.unwrap();
        let id = detail.invoice.id();

        let early = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert!(intake.mark_paid(id, early).await.is_err());

        let paid = intake.mark_paid(id, NaiveDate::from_ymd_opt(2026, 2, 1).unwrap()).await.unwrap();
        assert_eq!(paid.payment_status(), PaymentStatus::Paid);
        let unpaid = intake.mark_unpaid(id).await.unwrap();
        assert_eq!(unpaid.payment_status(), PaymentStatus::Unpaid);
        assert_eq!(
            intake.get(id).await.unwrap().batches[0].status(),
            BatchStatus::Unallocated
        );
    }
}
