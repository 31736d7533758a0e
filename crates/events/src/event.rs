use chrono::{DateTime, Utc};
use uuid::Uuid;

/// An immutable journal fact about one record.
///
/// Each event belongs to exactly one stream (`STREAM_TYPE` + `stream_id`);
/// streams are append-only and ordered by sequence number.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Kind of record the stream tracks (e.g. "inventory.batch").
    const STREAM_TYPE: &'static str;

    /// Id of the record this event is journaled under.
    fn stream_id(&self) -> Uuid;

    /// Stable name of the event (e.g. "inventory.batch.split").
    fn event_type(&self) -> &'static str;

    /// Payload schema version.
    fn version(&self) -> u32;

    /// Business time of the change.
    fn occurred_at(&self) -> DateTime<Utc>;
}
