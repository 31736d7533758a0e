//! Sales domain module.
//!
//! Point-of-sale records and the First-Expire-First-Out consumption plan that
//! decides which bound batches a sale draws from. No IO, no storage.

pub mod fefo;
pub mod sale;

pub use fefo::{Deduction, available_for, plan_consumption};
pub use sale::{
    MergedLine, PaymentMethod, SaleLineItem, SaleRequestLine, SaleTransaction, merge_lines,
};
