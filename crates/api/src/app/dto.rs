use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use pharmastock_core::{BatchId, DomainError, DomainResult, Entity, InvoiceId};
use pharmastock_infra::{Allocation, InvoiceDetail, ResizeRequest};
use pharmastock_inventory::Batch;
use pharmastock_products::{ProductAttrs, Product};
use pharmastock_purchasing::{InvoiceHeader, InvoiceLineInput, PaymentStatus, PurchaseInvoice};

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /purchases` and `PUT /purchases/:id`.
#[derive(Debug, Deserialize)]
pub struct InvoiceRequest {
    #[serde(flatten)]
    pub header: InvoiceHeader,
    pub lines: Vec<InvoiceLineInput>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentRequest {
    pub paid: bool,
    #[serde(default)]
    pub payment_date: Option<NaiveDate>,
}

impl PaymentRequest {
    /// `Some(date)` to mark paid, `None` to mark unpaid.
    pub fn payment_date(&self) -> DomainResult<Option<NaiveDate>> {
        match (self.paid, self.payment_date) {
            (true, Some(date)) => Ok(Some(date)),
            (true, None) => Err(DomainError::validation("payment_date", "required when marking paid")),
            (false, _) => Ok(None),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateProductRequest {
    pub batch_id: BatchId,
    pub quantity: i64,
    #[serde(flatten)]
    pub attrs: ProductAttrs,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProductRequest {
    #[serde(flatten)]
    pub attrs: ProductAttrs,
    #[serde(default)]
    pub lines: Vec<ResizeRequest>,
}

#[derive(Debug, Deserialize)]
pub struct AddAllocationRequest {
    pub batch_id: BatchId,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct QuoteQuery {
    pub qty: i64,
}

#[derive(Debug, Deserialize)]
pub struct ExpiringQuery {
    pub within_days: u32,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct InvoiceResponse {
    pub id: InvoiceId,
    pub payment_status: PaymentStatus,
    pub total: i64,
    pub invoice: PurchaseInvoice,
    pub batches: Vec<Batch>,
}

impl From<InvoiceDetail> for InvoiceResponse {
    fn from(detail: InvoiceDetail) -> Self {
        Self {
            id: detail.invoice.id(),
            payment_status: detail.invoice.payment_status(),
            total: detail.invoice.total(),
            invoice: detail.invoice,
            batches: detail.batches,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InvoiceSummary {
    pub id: InvoiceId,
    pub payment_status: PaymentStatus,
    pub total: i64,
}

impl From<&PurchaseInvoice> for InvoiceSummary {
    fn from(invoice: &PurchaseInvoice) -> Self {
        Self {
            id: invoice.id(),
            payment_status: invoice.payment_status(),
            total: invoice.total(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AllocationResponse {
    pub product: Product,
    pub batch: Batch,
}

impl From<Allocation> for AllocationResponse {
    fn from(a: Allocation) -> Self {
        Self {
            product: a.product,
            batch: a.line,
        }
    }
}
