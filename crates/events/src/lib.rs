//! Domain events and the envelope they are journaled in.
//!
//! Events here are audit facts: every change to a batch's quantity or binding
//! is appended to a per-batch stream inside the same transaction that made it.

pub mod envelope;
pub mod event;

pub use envelope::EventEnvelope;
pub use event::Event;
