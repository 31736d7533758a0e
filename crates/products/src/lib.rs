//! Product catalog domain module.
//!
//! The sellable identity of stock (name, price, category, image). Quantity is
//! never stored on a product; it is derived from the batches linked to it.

pub mod product;

pub use product::{DeletionMode, Product, ProductAttrs, ProductParts, ProductStatus, total_stock};
