use core::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use pharmastock_core::{BatchId, DomainError, DomainResult, Entity, InvoiceId, LineId, ProductId};

/// The attributes a lot is received with. Together with the invoice and line
/// they form the lot's [`MergeKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LotSpec {
    pub product_name: String,
    pub packaging_unit: String,
    /// Cost per packaging unit, in the smallest currency unit.
    pub unit_cost: i64,
    pub expiry_date: Option<NaiveDate>,
}

/// Exact-match key used to fold quantity back into an existing warehouse row.
///
/// This is a lookup key, not a reference: two rows merge only when every
/// field is equal. The invoice line is part of the key: returned stock only
/// folds into a row of the line it was received on, so two lines of one
/// invoice with the same lot never share a row and each line's received
/// quantity is conserved on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeKey {
    pub invoice_id: InvoiceId,
    pub line_id: LineId,
    pub product_name: String,
    pub packaging_unit: String,
    pub unit_cost: i64,
    pub expiry_date: Option<NaiveDate>,
}

/// Explicit lifecycle state of a batch row.
///
/// ```text
/// Unallocated --allocate--> Allocated --consume*--> Depleted
///      ^                        |
///      +---------unbind---------+
/// ```
///
/// `Depleted` is terminal. It remembers the product it was sold through until
/// that product releases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchState {
    Unallocated,
    Allocated { product_id: ProductId },
    Depleted { product_id: Option<ProductId> },
}

/// Status tag without payload (storage column / API field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Unallocated,
    Allocated,
    Depleted,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Unallocated => "unallocated",
            BatchStatus::Allocated => "allocated",
            BatchStatus::Depleted => "depleted",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "unallocated" => Ok(BatchStatus::Unallocated),
            "allocated" => Ok(BatchStatus::Allocated),
            "depleted" => Ok(BatchStatus::Depleted),
            other => Err(DomainError::storage(format!("unknown batch status '{other}'"))),
        }
    }
}

impl BatchState {
    pub fn status(&self) -> BatchStatus {
        match self {
            BatchState::Unallocated => BatchStatus::Unallocated,
            BatchState::Allocated { .. } => BatchStatus::Allocated,
            BatchState::Depleted { .. } => BatchStatus::Depleted,
        }
    }

    pub fn linked_product_id(&self) -> Option<ProductId> {
        match *self {
            BatchState::Unallocated => None,
            BatchState::Allocated { product_id } => Some(product_id),
            BatchState::Depleted { product_id } => product_id,
        }
    }

    /// Rebuild the state from its persisted columns.
    pub fn from_columns(status: BatchStatus, product_id: Option<ProductId>) -> DomainResult<Self> {
        match (status, product_id) {
            (BatchStatus::Unallocated, None) => Ok(BatchState::Unallocated),
            (BatchStatus::Allocated, Some(product_id)) => Ok(BatchState::Allocated { product_id }),
            (BatchStatus::Depleted, product_id) => Ok(BatchState::Depleted { product_id }),
            (status, product_id) => Err(DomainError::storage(format!(
                "inconsistent batch columns: status={status:?} product={product_id:?}"
            ))),
        }
    }
}

/// Every persisted column of a batch row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchParts {
    pub id: BatchId,
    pub invoice_id: InvoiceId,
    pub line_id: LineId,
    pub lot: LotSpec,
    pub remaining_quantity: i64,
    pub state: BatchState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A lot row: quantity of one invoice line, possibly bound to a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    id: BatchId,
    invoice_id: InvoiceId,
    line_id: LineId,
    lot: LotSpec,
    remaining_quantity: i64,
    state: BatchState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Entity for Batch {
    type Id = BatchId;

    fn id(&self) -> BatchId {
        self.id
    }
}

impl Batch {
    /// A freshly received warehouse row.
    pub fn receive(
        id: BatchId,
        invoice_id: InvoiceId,
        line_id: LineId,
        lot: LotSpec,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if quantity <= 0 {
            return Err(DomainError::validation("quantity", "must be positive"));
        }
        Ok(Self {
            id,
            invoice_id,
            line_id,
            lot,
            remaining_quantity: quantity,
            state: BatchState::Unallocated,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rebuild a row loaded from storage, checking state/quantity agreement.
    pub fn restore(parts: BatchParts) -> DomainResult<Self> {
        let consistent = match parts.state {
            BatchState::Depleted { .. } => parts.remaining_quantity == 0,
            _ => parts.remaining_quantity > 0,
        };
        if !consistent {
            return Err(DomainError::storage(format!(
                "batch {} has quantity {} in state {:?}",
                parts.id, parts.remaining_quantity, parts.state
            )));
        }
        Ok(Self {
            id: parts.id,
            invoice_id: parts.invoice_id,
            line_id: parts.line_id,
            lot: parts.lot,
            remaining_quantity: parts.remaining_quantity,
            state: parts.state,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        })
    }

    pub fn invoice_id(&self) -> InvoiceId {
        self.invoice_id
    }

    pub fn line_id(&self) -> LineId {
        self.line_id
    }

    pub fn lot(&self) -> &LotSpec {
        &self.lot
    }

    pub fn product_name(&self) -> &str {
        &self.lot.product_name
    }

    pub fn expiry_date(&self) -> Option<NaiveDate> {
        self.lot.expiry_date
    }

    pub fn remaining_quantity(&self) -> i64 {
        self.remaining_quantity
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn status(&self) -> BatchStatus {
        self.state.status()
    }

    pub fn linked_product_id(&self) -> Option<ProductId> {
        self.state.linked_product_id()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn merge_key(&self) -> MergeKey {
        MergeKey {
            invoice_id: self.invoice_id,
            line_id: self.line_id,
            product_name: self.lot.product_name.clone(),
            packaging_unit: self.lot.packaging_unit.clone(),
            unit_cost: self.lot.unit_cost,
            expiry_date: self.lot.expiry_date,
        }
    }

    /// Sellable or mergeable: not bound to a product and not empty.
    pub fn is_in_warehouse(&self) -> bool {
        self.state == BatchState::Unallocated
    }

    pub fn is_allocated_to(&self, product_id: ProductId) -> bool {
        self.state == BatchState::Allocated { product_id }
    }

    /// Ordering key for First-Expire-First-Out: earliest expiry first, rows
    /// without expiry last, then lowest id.
    pub fn fefo_cmp(&self, other: &Batch) -> Ordering {
        match (self.lot.expiry_date, other.lot.expiry_date) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| self.id.cmp(&other.id))
    }

    /// Remove `quantity` from this row. Reaching zero depletes it.
    pub fn deduct(&mut self, quantity: i64, now: DateTime<Utc>) -> DomainResult<()> {
        if quantity <= 0 {
            return Err(DomainError::validation("quantity", "must be positive"));
        }
        if quantity > self.remaining_quantity {
            return Err(DomainError::insufficient_stock(quantity, self.remaining_quantity));
        }
        self.remaining_quantity -= quantity;
        if self.remaining_quantity == 0 {
            self.state = BatchState::Depleted {
                product_id: self.state.linked_product_id(),
            };
        }
        self.updated_at = now;
        Ok(())
    }

    /// Add `quantity` back to a live row.
    pub fn credit(&mut self, quantity: i64, now: DateTime<Utc>) -> DomainResult<()> {
        if quantity <= 0 {
            return Err(DomainError::validation("quantity", "must be positive"));
        }
        if self.status() == BatchStatus::Depleted {
            return Err(DomainError::conflict(format!(
                "batch {} is depleted and cannot be restocked",
                self.id
            )));
        }
        self.remaining_quantity += quantity;
        self.updated_at = now;
        Ok(())
    }

    /// Signed adjustment; the result may not go below zero.
    pub fn adjust(&mut self, delta: i64, now: DateTime<Utc>) -> DomainResult<()> {
        match delta.cmp(&0) {
            Ordering::Greater => self.credit(delta, now),
            Ordering::Less => self.deduct(-delta, now),
            Ordering::Equal => Err(DomainError::validation("delta", "cannot be zero")),
        }
    }

    /// Split `quantity` off this warehouse row into a new row bound to
    /// `product_id`. Physical quantity is conserved across the split.
    pub fn carve(
        &mut self,
        new_id: BatchId,
        quantity: i64,
        product_id: ProductId,
        now: DateTime<Utc>,
    ) -> DomainResult<Batch> {
        if !self.is_in_warehouse() {
            return Err(DomainError::conflict(format!(
                "batch {} is not in the warehouse",
                self.id
            )));
        }
        self.deduct(quantity, now)?;
        Ok(Batch {
            id: new_id,
            invoice_id: self.invoice_id,
            line_id: self.line_id,
            lot: self.lot.clone(),
            remaining_quantity: quantity,
            state: BatchState::Allocated { product_id },
            created_at: now,
            updated_at: now,
        })
    }

    /// A new warehouse row with this row's merge key and `quantity`.
    ///
    /// The caller is responsible for taking `quantity` from somewhere.
    pub fn warehouse_twin(&self, new_id: BatchId, quantity: i64, now: DateTime<Utc>) -> DomainResult<Batch> {
        Batch::receive(new_id, self.invoice_id, self.line_id, self.lot.clone(), quantity, now)
    }

    /// Drop the product binding. Returns the product that was released, if any.
    pub fn unlink(&mut self, now: DateTime<Utc>) -> Option<ProductId> {
        let released = self.state.linked_product_id();
        self.state = match self.state {
            BatchState::Allocated { .. } => BatchState::Unallocated,
            BatchState::Depleted { .. } => BatchState::Depleted { product_id: None },
            BatchState::Unallocated => BatchState::Unallocated,
        };
        if released.is_some() {
            self.updated_at = now;
        }
        released
    }

    /// Replace lot attributes in place (invoice correction of an untouched line).
    pub fn relabel(&mut self, lot: LotSpec, now: DateTime<Utc>) -> DomainResult<()> {
        if self.linked_product_id().is_some() {
            return Err(DomainError::conflict(format!(
                "batch {} is bound to a product; its lot attributes are fixed",
                self.id
            )));
        }
        self.lot = lot;
        self.updated_at = now;
        Ok(())
    }

    pub fn into_parts(self) -> BatchParts {
        BatchParts {
            id: self.id,
            invoice_id: self.invoice_id,
            line_id: self.line_id,
            lot: self.lot,
            remaining_quantity: self.remaining_quantity,
            state: self.state,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
