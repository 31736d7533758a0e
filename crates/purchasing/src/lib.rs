//! Purchasing domain module (purchase invoices).
//!
//! Validates supplier invoices, derives their totals, and diffs revised line
//! sets by line identity so edits never recreate lines that already feed
//! product stock. Deterministic domain logic only (no IO, no storage).

pub mod invoice;

pub use invoice::{
    IntakePolicy, InvoiceHeader, InvoiceLine, InvoiceLineInput, InvoiceParts, LineChange,
    LineDiff, PaymentStatus, PurchaseInvoice, diff_lines,
};
