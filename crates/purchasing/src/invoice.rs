use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use pharmastock_core::{DomainError, DomainResult, Entity, InvoiceId, LineId, SupplierId};
use pharmastock_inventory::LotSpec;

/// Header fields of a supplier invoice, as submitted by purchase entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceHeader {
    pub invoice_number: String,
    #[serde(default)]
    pub supplier_id: Option<SupplierId>,
    pub invoice_date: NaiveDate,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    /// `None` means the invoice is still unpaid.
    #[serde(default)]
    pub payment_date: Option<NaiveDate>,
}

/// A submitted invoice line.
///
/// `line_id` is absent for new lines. On revision, a present id must name an
/// existing line of the same invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLineInput {
    #[serde(default)]
    pub line_id: Option<LineId>,
    pub product_name: String,
    pub quantity: i64,
    pub packaging_unit: String,
    pub unit_cost: i64,
    #[serde(default)]
    pub expiry_date: Option<NaiveDate>,
}

/// A line as received: the lot and the quantity that arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub line_id: LineId,
    pub lot: LotSpec,
    pub quantity: i64,
}

impl InvoiceLine {
    pub fn subtotal(&self) -> Option<i64> {
        self.quantity.checked_mul(self.lot.unit_cost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

/// Business rules applied at intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakePolicy {
    /// Reject lines without an expiry date.
    pub require_expiry: bool,
}

impl Default for IntakePolicy {
    fn default() -> Self {
        Self { require_expiry: true }
    }
}

impl IntakePolicy {
    pub fn validate_header(&self, header: &InvoiceHeader) -> DomainResult<()> {
        if header.invoice_number.trim().is_empty() {
            return Err(DomainError::validation("invoice_number", "cannot be empty"));
        }
        if header.due_date.is_some_and(|due| due < header.invoice_date) {
            return Err(DomainError::validation(
                "due_date",
                "cannot be before the invoice date",
            ));
        }
        if header.payment_date.is_some_and(|paid| paid < header.invoice_date) {
            return Err(DomainError::validation(
                "payment_date",
                "cannot be before the invoice date",
            ));
        }
        Ok(())
    }

    /// Check one line and turn it into the lot it describes.
    pub fn validate_line(&self, line: &InvoiceLineInput) -> DomainResult<LotSpec> {
        if line.product_name.trim().is_empty() {
            return Err(DomainError::validation("product_name", "cannot be empty"));
        }
        if line.quantity <= 0 {
            return Err(DomainError::validation("quantity", "must be positive"));
        }
        if line.unit_cost <= 0 {
            return Err(DomainError::validation("unit_cost", "must be positive"));
        }
        if line.packaging_unit.trim().is_empty() {
            return Err(DomainError::validation("packaging_unit", "cannot be empty"));
        }
        if self.require_expiry && line.expiry_date.is_none() {
            return Err(DomainError::validation("expiry_date", "is required"));
        }
        if line.quantity.checked_mul(line.unit_cost).is_none() {
            return Err(DomainError::validation("quantity", "line subtotal overflows"));
        }
        Ok(LotSpec {
            product_name: line.product_name.trim().to_string(),
            packaging_unit: line.packaging_unit.trim().to_string(),
            unit_cost: line.unit_cost,
            expiry_date: line.expiry_date,
        })
    }
}

/// An existing line whose lot or quantity was edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineChange {
    /// Position of the line in the submitted list.
    pub index: usize,
    pub previous: InvoiceLine,
    pub next: InvoiceLine,
}

impl LineChange {
    pub fn lot_changed(&self) -> bool {
        self.previous.lot != self.next.lot
    }

    pub fn quantity_delta(&self) -> i64 {
        self.next.quantity - self.previous.quantity
    }
}

/// Identity diff between the stored lines and a revised submission.
///
/// Lines present on both sides with identical content appear nowhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineDiff {
    pub updated: Vec<LineChange>,
    pub added: Vec<InvoiceLine>,
    pub removed: Vec<InvoiceLine>,
}

impl LineDiff {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

/// Match `submitted` against `existing` by line id.
///
/// Submitted lines without an id get a fresh one. An id that is not among
/// `existing`, or one that appears twice, is a validation error on that line.
pub fn diff_lines(existing: &[InvoiceLine], submitted: &[(Option<LineId>, LotSpec, i64)]) -> DomainResult<LineDiff> {
    let by_id: BTreeMap<LineId, &InvoiceLine> = existing.iter().map(|l| (l.line_id, l)).collect();
    let mut seen = BTreeSet::new();
    let mut diff = LineDiff::default();

    for (index, (line_id, lot, quantity)) in submitted.iter().enumerate() {
        let next = InvoiceLine {
            line_id: line_id.unwrap_or_default(),
            lot: lot.clone(),
            quantity: *quantity,
        };
        let Some(id) = line_id else {
            diff.added.push(next);
            continue;
        };
        if !seen.insert(*id) {
            return Err(DomainError::validation("line_id", format!("line {id} submitted twice")).at_line(index));
        }
        let Some(previous) = by_id.get(id) else {
            return Err(DomainError::validation(
                "line_id",
                format!("line {id} does not belong to this invoice"),
            )
            .at_line(index));
        };
        if **previous != next {
            diff.updated.push(LineChange {
                index,
                previous: (*previous).clone(),
                next,
            });
        }
    }

    diff.removed = existing
        .iter()
        .filter(|l| !seen.contains(&l.line_id))
        .cloned()
        .collect();
    Ok(diff)
}

/// Every persisted column of an invoice header plus its received lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceParts {
    pub id: InvoiceId,
    pub header: InvoiceHeader,
    pub lines: Vec<InvoiceLine>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A supplier invoice and the lines it was received with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseInvoice {
    id: InvoiceId,
    header: InvoiceHeader,
    lines: Vec<InvoiceLine>,
    total: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Entity for PurchaseInvoice {
    type Id = InvoiceId;

    fn id(&self) -> InvoiceId {
        self.id
    }
}

fn validate_lines(
    policy: &IntakePolicy,
    inputs: &[InvoiceLineInput],
) -> DomainResult<Vec<(Option<LineId>, LotSpec, i64)>> {
    if inputs.is_empty() {
        return Err(DomainError::validation("lines", "an invoice needs at least one line"));
    }
    inputs
        .iter()
        .enumerate()
        .map(|(index, input)| {
            let lot = policy.validate_line(input).map_err(|e| e.at_line(index))?;
            Ok((input.line_id, lot, input.quantity))
        })
        .collect()
}

fn total_of(lines: &[InvoiceLine]) -> DomainResult<i64> {
    lines.iter().try_fold(0i64, |acc, line| {
        line.subtotal()
            .and_then(|s| acc.checked_add(s))
            .ok_or_else(|| DomainError::validation("lines", "invoice total overflows"))
    })
}

impl PurchaseInvoice {
    /// Validate a new invoice. Lines keep a submitted id or get a fresh one.
    pub fn receive(
        id: InvoiceId,
        header: InvoiceHeader,
        inputs: &[InvoiceLineInput],
        policy: &IntakePolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        policy.validate_header(&header)?;
        let validated = validate_lines(policy, inputs)?;

        let mut seen = BTreeSet::new();
        let mut lines = Vec::with_capacity(validated.len());
        for (index, (line_id, lot, quantity)) in validated.into_iter().enumerate() {
            let line_id = line_id.unwrap_or_default();
            if !seen.insert(line_id) {
                return Err(DomainError::validation("line_id", "submitted twice").at_line(index));
            }
            lines.push(InvoiceLine { line_id, lot, quantity });
        }

        let total = total_of(&lines)?;
        Ok(Self {
            id,
            header,
            lines,
            total,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn restore(parts: InvoiceParts) -> DomainResult<Self> {
        let total = total_of(&parts.lines).map_err(|e| DomainError::storage(e.to_string()))?;
        Ok(Self {
            id: parts.id,
            header: parts.header,
            lines: parts.lines,
            total,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        })
    }

    pub fn header(&self) -> &InvoiceHeader {
        &self.header
    }

    pub fn invoice_number(&self) -> &str {
        &self.header.invoice_number
    }

    pub fn lines(&self) -> &[InvoiceLine] {
        &self.lines
    }

    pub fn line(&self, line_id: LineId) -> Option<&InvoiceLine> {
        self.lines.iter().find(|l| l.line_id == line_id)
    }

    /// Sum of line subtotals, in the smallest currency unit.
    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn payment_status(&self) -> PaymentStatus {
        match self.header.payment_date {
            Some(_) => PaymentStatus::Paid,
            None => PaymentStatus::Unpaid,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn mark_paid(&mut self, payment_date: NaiveDate, now: DateTime<Utc>) -> DomainResult<()> {
        if payment_date < self.header.invoice_date {
            return Err(DomainError::validation(
                "payment_date",
                "cannot be before the invoice date",
            ));
        }
        self.header.payment_date = Some(payment_date);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_unpaid(&mut self, now: DateTime<Utc>) {
        self.header.payment_date = None;
        self.updated_at = now;
    }

    /// Replace header and lines, returning what changed line by line.
    ///
    /// The invoice is left untouched when validation fails.
    pub fn revise(
        &mut self,
        header: InvoiceHeader,
        inputs: &[InvoiceLineInput],
        policy: &IntakePolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<LineDiff> {
        policy.validate_header(&header)?;
        let validated = validate_lines(policy, inputs)?;
        let diff = diff_lines(&self.lines, &validated)?;

        let mut added = diff.added.iter();
        let lines: Vec<InvoiceLine> = validated
            .into_iter()
            .filter_map(|(line_id, lot, quantity)| match line_id {
                Some(line_id) => Some(InvoiceLine { line_id, lot, quantity }),
                None => added.next().cloned(),
            })
            .collect();
        let total = total_of(&lines)?;

        self.header = header;
        self.lines = lines;
        self.total = total;
        self.updated_at = now;
        Ok(diff)
    }

    pub fn into_parts(self) -> InvoiceParts {
        InvoiceParts {
            id: self.id,
            header: self.header,
            lines: self.lines,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn header(number: &str) -> InvoiceHeader {
        InvoiceHeader {
            invoice_number: number.to_string(),
            supplier_id: None,
            invoice_date: date(2024, 11, 1),
            due_date: Some(date(2024, 12, 1)),
            payment_date: None,
        }
    }

    fn input(name: &str, quantity: i64, unit_cost: i64) -> InvoiceLineInput {
        InvoiceLineInput {
            line_id: None,
            product_name: name.to_string(),
            quantity,
            packaging_unit: "box".to_string(),
            unit_cost,
            expiry_date: Some(date(2025, 12, 31)),
        }
    }

    fn received() -> PurchaseInvoice {
        PurchaseInvoice::receive(
            InvoiceId::new(),
            header("INV-1"),
            &[input("Amoxicillin", 100, 1000), input("Paracetamol", 20, 250)],
            &IntakePolicy::default(),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn receive_computes_total_and_assigns_line_ids() {
        let invoice = received();
        assert_eq!(invoice.total(), 100 * 1000 + 20 * 250);
        assert_eq!(invoice.payment_status(), PaymentStatus::Unpaid);
        assert_ne!(invoice.lines()[0].line_id, invoice.lines()[1].line_id);
    }

    #[test]
    fn line_validation_points_at_the_failing_line() {
        let policy = IntakePolicy::default();
        let mut missing_expiry = input("Ibuprofen", 5, 100);
        missing_expiry.expiry_date = None;

        let err = PurchaseInvoice::receive(
            InvoiceId::new(),
            header("INV-2"),
            &[input("Amoxicillin", 1, 1), missing_expiry.clone()],
            &policy,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, DomainError::validation("lines[1].expiry_date", "is required"));

        let relaxed = IntakePolicy { require_expiry: false };
        assert!(relaxed.validate_line(&missing_expiry).is_ok());

        for (bad, field) in [
            (input("Amoxicillin", 0, 1), "quantity"),
            (input("Amoxicillin", 1, 0), "unit_cost"),
            (input(" ", 1, 1), "product_name"),
        ] {
            assert!(matches!(
                policy.validate_line(&bad),
                Err(DomainError::Validation { field: ref f, .. }) if f == field
            ));
        }
    }

    #[test]
    fn header_rules() {
        let policy = IntakePolicy::default();
        assert!(policy.validate_header(&header("")).is_err());

        let mut early_due = header("INV-3");
        early_due.due_date = Some(date(2024, 10, 1));
        assert!(matches!(
            policy.validate_header(&early_due),
            Err(DomainError::Validation { ref field, .. }) if field == "due_date"
        ));
    }

    #[test]
    fn payment_flips_status() {
        let mut invoice = received();
        invoice.mark_paid(date(2024, 11, 15), Utc::now()).unwrap();
        assert_eq!(invoice.payment_status(), PaymentStatus::Paid);
        assert!(invoice.mark_paid(date(2024, 10, 15), Utc::now()).is_err());
        invoice.mark_unpaid(Utc::now());
        assert_eq!(invoice.payment_status(), PaymentStatus::Unpaid);
    }

    #[test]
    fn revise_diffs_lines_by_identity() {
        let mut invoice = received();
        let amox = invoice.lines()[0].clone();
        let para = invoice.lines()[1].clone();

        let mut keep = input("Amoxicillin", 120, 1000);
        keep.line_id = Some(amox.line_id);
        let fresh = input("Cetirizine", 10, 300);

        let diff = invoice
            .revise(header("INV-1"), &[keep, fresh], &IntakePolicy::default(), Utc::now())
            .unwrap();

        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.updated[0].index, 0);
        assert_eq!(diff.updated[0].quantity_delta(), 20);
        assert!(!diff.updated[0].lot_changed());
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.removed, vec![para]);

        assert_eq!(invoice.lines().len(), 2);
        assert_eq!(invoice.lines()[0].line_id, amox.line_id);
        assert_eq!(invoice.lines()[1].line_id, diff.added[0].line_id);
        assert_eq!(invoice.total(), 120 * 1000 + 10 * 300);
    }

    #[test]
    fn unchanged_lines_are_not_reported() {
        let mut invoice = received();
        let resubmitted: Vec<InvoiceLineInput> = invoice
            .lines()
            .iter()
            .map(|l| InvoiceLineInput {
                line_id: Some(l.line_id),
                product_name: l.lot.product_name.clone(),
                quantity: l.quantity,
                packaging_unit: l.lot.packaging_unit.clone(),
                unit_cost: l.lot.unit_cost,
                expiry_date: l.lot.expiry_date,
            })
            .collect();

        let diff = invoice
            .revise(header("INV-1"), &resubmitted, &IntakePolicy::default(), Utc::now())
            .unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn foreign_line_id_is_rejected_and_invoice_untouched() {
        let mut invoice = received();
        let before = invoice.clone();
        let mut stray = input("Amoxicillin", 1, 1);
        stray.line_id = Some(LineId::new());

        let err = invoice
            .revise(header("INV-1"), &[stray], &IntakePolicy::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation { ref field, .. } if field == "lines[0].line_id"));
        assert_eq!(invoice, before);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use uuid::Uuid;

        fn lot(n: u32) -> LotSpec {
            LotSpec {
                product_name: format!("drug-{n}"),
                packaging_unit: "box".to_string(),
                unit_cost: 100,
                expiry_date: None,
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Every stored line lands in exactly one of kept / updated / removed,
            /// and every submitted line without an id is reported as added.
            #[test]
            fn diff_partitions_lines(
                existing_n in 0usize..8,
                keep_mask in prop::collection::vec(any::<bool>(), 8),
                bump_mask in prop::collection::vec(any::<bool>(), 8),
                new_n in 0usize..4,
            ) {
                let existing: Vec<InvoiceLine> = (0..existing_n)
                    .map(|i| InvoiceLine {
                        line_id: LineId::from_uuid(Uuid::from_u128(i as u128 + 1)),
                        lot: lot(i as u32),
                        quantity: 10,
                    })
                    .collect();

                let mut submitted = Vec::new();
                for (i, line) in existing.iter().enumerate() {
                    if keep_mask[i] {
                        let qty = if bump_mask[i] { 11 } else { 10 };
                        submitted.push((Some(line.line_id), line.lot.clone(), qty));
                    }
                }
                for n in 0..new_n {
                    submitted.push((None, lot(100 + n as u32), 5));
                }

                let diff = diff_lines(&existing, &submitted).unwrap();

                let kept = (0..existing_n).filter(|&i| keep_mask[i]).count();
                let bumped = (0..existing_n).filter(|&i| keep_mask[i] && bump_mask[i]).count();
                prop_assert_eq!(diff.updated.len(), bumped);
                prop_assert_eq!(diff.removed.len(), existing_n - kept);
                prop_assert_eq!(diff.added.len(), new_n);
                for change in &diff.updated {
                    prop_assert_eq!(change.quantity_delta(), 1);
                }
            }
        }
    }
}
