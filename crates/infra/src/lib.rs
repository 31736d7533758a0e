//! Infrastructure layer: transactional stores and the engines that run the
//! batch ledger on top of them.
//!
//! Domain crates decide; this crate executes those decisions inside one
//! store transaction per operation.

pub mod allocation;
pub mod catalog;
pub mod consumption;
pub mod intake;
pub mod ledger;
pub mod store;


pub use allocation::{Allocation, AllocationManager};
pub use catalog::{ProductCatalog, ProductDetail, ResizeRequest};
pub use consumption::{Quote, SaleEngine, SaleRequest};
pub use intake::{InvoiceDetail, PurchaseIntake};
pub use ledger::{BatchLedger, LedgerSession};
pub use store::{InMemoryInventoryStore, InventoryStore, LedgerTx, PostgresInventoryStore};
