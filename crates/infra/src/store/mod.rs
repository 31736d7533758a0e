//! Transactional store boundary for the ledger.
//!
//! The engines only talk to [`InventoryStore`] / [`LedgerTx`]; the in-memory
//! store serves tests and local runs, the Postgres store serves production.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryInventoryStore;
pub use postgres::PostgresInventoryStore;
pub use r#trait::{InventoryStore, LedgerTx};
