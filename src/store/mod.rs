use std::ops::Deref;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::event::Event;
use crate::types::{GlobalSequence, SequenceNumber};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStore;

/// Failures of the durable log.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The caller's assumed aggregate version is stale. Re-read the current
    /// version and retry the originating business operation; the store never
    /// retries on its own.
    #[error(
        "concurrency conflict on {aggregate_type}/{aggregate_id}: \
         expected sequence number {expected}, current is {current}"
    )]
    ConcurrencyConflict {
        aggregate_type: String,
        aggregate_id: String,
        expected: SequenceNumber,
        current: SequenceNumber,
    },
    /// Transient infrastructure failure. Safe to retry with backoff; the
    /// event is guaranteed not persisted.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Payload serialization/deserialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// An atomic batch must target a single aggregate instance.
    #[error("event batch spans more than one aggregate")]
    BatchSpansAggregates,
}

#[cfg(feature = "sql")]
impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        Self::StorageUnavailable(Box::new(error))
    }
}

/// An event as supplied by the caller, before persistence.
///
/// Sequence numbers and the `recorded_at` timestamp are assigned by the store
/// inside [`EventStore::append`].
#[derive(Clone, Debug)]
pub struct NewEvent {
    aggregate_type: String,
    aggregate_id: String,
    event_kind: String,
    schema_version: i32,
    payload: serde_json::Value,
}

impl NewEvent {
    /// Builds a [`NewEvent`] from a typed [`Event`], serializing its payload.
    pub fn new<E: Event>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event: &E,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_kind: E::KIND.to_string(),
            schema_version: E::SCHEMA_VERSION,
            payload: serde_json::to_value(event)?,
        })
    }

    /// Builds a [`NewEvent`] from an already serialized payload.
    pub fn from_raw(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_kind: impl Into<String>,
        schema_version: i32,
        payload: serde_json::Value,
    ) -> Self {
        debug_assert!(schema_version >= 1, "schema_version must be positive");
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_kind: event_kind.into(),
            schema_version,
            payload,
        }
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn event_kind(&self) -> &str {
        &self.event_kind
    }
}

/// An `EventRecord` is one persisted, immutable occurrence: the caller-supplied
/// payload alongside the identity and ordering metadata assigned by the store.
#[derive(Clone, Debug)]
pub struct EventRecord {
    /// Uniquely identifies the record among all events of all aggregates.
    pub id: Uuid,
    /// The aggregate kind that emitted the event, e.g. "user".
    pub aggregate_type: String,
    /// The aggregate instance that emitted the event.
    pub aggregate_id: String,
    /// Discriminator of the event's semantic type.
    pub event_kind: String,
    /// Version of the payload shape.
    pub schema_version: i32,
    /// The original, emitted, event.
    pub payload: serde_json::Value,
    /// Position of the event within its aggregate's history.
    pub sequence_number: SequenceNumber,
    /// Position of the event within the whole log.
    pub global_sequence: GlobalSequence,
    /// The timestamp of when the event was persisted.
    pub recorded_at: DateTime<Utc>,
}

impl EventRecord {
    /// Returns the sequence number of the event, within its specific aggregate instance.
    pub const fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    /// Returns the original, emitted, event payload.
    pub const fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Decodes the payload back into a typed [`Event`].
    pub fn payload_as<E: Event>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// An `EventStore` is responsible for the durable, ordered, append-only
/// persistence of [`EventRecord`]s, with lookup by aggregate and by global
/// order.
///
/// The atomic compare-and-assign inside [`EventStore::append`] is the single
/// serialization point preventing divergent histories for one aggregate: two
/// concurrent appends assuming the same `expected_sequence_number` must not
/// both succeed.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durably appends one event.
    ///
    /// `expected_sequence_number` is the caller's belief about the current
    /// aggregate version, `0` meaning "no prior events expected". On success
    /// the returned record carries `sequence_number = expected + 1`, the next
    /// global sequence and the persistence timestamp.
    ///
    /// # Errors
    ///
    /// [`StoreError::ConcurrencyConflict`] when the aggregate's current
    /// version differs from the expected one, [`StoreError::StorageUnavailable`]
    /// on infrastructure failure. In both cases nothing was persisted.
    async fn append(
        &self,
        event: NewEvent,
        expected_sequence_number: SequenceNumber,
    ) -> Result<EventRecord, StoreError>;

    /// Durably appends multiple events of a single aggregate as one
    /// contiguous, atomic sequence range: either all are persisted or none is.
    async fn append_all(
        &self,
        events: Vec<NewEvent>,
        expected_sequence_number: SequenceNumber,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Returns the current version of an aggregate, `0` when it has no events.
    ///
    /// This is what a caller re-reads before retrying after a
    /// [`StoreError::ConcurrencyConflict`].
    async fn current_sequence(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<SequenceNumber, StoreError>;

    /// Loads the events of one aggregate with `sequence_number >= from_sequence`,
    /// ascending.
    async fn events_for_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        from_sequence: SequenceNumber,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Streams the whole log with `global_sequence >= from_global_sequence`,
    /// ascending, backed by a cursor over the store rather than materializing
    /// the history in memory.
    ///
    /// The stream is bounded by what exists at call time; re-invoke with an
    /// updated cursor to continue past it.
    fn all_events(
        &self,
        from_global_sequence: GlobalSequence,
    ) -> BoxStream<'_, Result<EventRecord, StoreError>>;
}

/// Blanket implementation making an [`EventStore`] every (smart) pointer to an
/// [`EventStore`], e.g. `&Store`, `Box<Store>`, `Arc<Store>`. This lets the
/// bus, the replayer and the query facade share one store instance.
#[async_trait]
impl<T> EventStore for T
where
    T: Deref + Send + Sync,
    T::Target: EventStore,
{
    async fn append(
        &self,
        event: NewEvent,
        expected_sequence_number: SequenceNumber,
    ) -> Result<EventRecord, StoreError> {
        self.deref().append(event, expected_sequence_number).await
    }

    async fn append_all(
        &self,
        events: Vec<NewEvent>,
        expected_sequence_number: SequenceNumber,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.deref().append_all(events, expected_sequence_number).await
    }

    async fn current_sequence(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<SequenceNumber, StoreError> {
        self.deref().current_sequence(aggregate_type, aggregate_id).await
    }

    async fn events_for_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        from_sequence: SequenceNumber,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.deref()
            .events_for_aggregate(aggregate_type, aggregate_id, from_sequence)
            .await
    }

    fn all_events(
        &self,
        from_global_sequence: GlobalSequence,
    ) -> BoxStream<'_, Result<EventRecord, StoreError>> {
        self.deref().all_events(from_global_sequence)
    }
}
