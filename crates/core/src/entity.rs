//! Entity trait: identity that survives quantity and binding changes.

/// A ledger or catalog record addressed by a stable, strongly-typed id.
///
/// Batches keep their id across decrements and re-binding; products keep
/// theirs across soft deletion.
pub trait Entity {
    type Id: Copy + Eq + Ord + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> Self::Id;
}
