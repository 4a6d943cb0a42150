use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::store::{EventRecord, EventStore, NewEvent, StoreError};
use crate::types::{GlobalSequence, SequenceNumber};

const STREAM_PAGE_SIZE: GlobalSequence = 64;

#[derive(Default)]
struct Inner {
    /// The whole log in `global_sequence` order; index is `global_sequence - 1`.
    log: Vec<EventRecord>,
    /// Current version per `(aggregate_type, aggregate_id)`.
    heads: HashMap<(String, String), SequenceNumber>,
}

/// In-process [`EventStore`] keeping the log behind a mutex.
///
/// The store is cheap to clone, every clone sharing the same log. It is the
/// reference implementation of the append contract and the store used
/// throughout the test suite; it is also usable as-is for single-process
/// deployments that don't need durability across restarts.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::StorageUnavailable("event log mutex poisoned".into()))
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn append(
        &self,
        event: NewEvent,
        expected_sequence_number: SequenceNumber,
    ) -> Result<EventRecord, StoreError> {
        let mut records = self.append_all(vec![event], expected_sequence_number).await?;
        // append_all on a one-element batch always yields one record
        records
            .pop()
            .ok_or_else(|| StoreError::StorageUnavailable("empty append result".into()))
    }

    async fn append_all(
        &self,
        events: Vec<NewEvent>,
        expected_sequence_number: SequenceNumber,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let Some(first) = events.first() else {
            return Ok(vec![]);
        };
        let key = (first.aggregate_type().to_string(), first.aggregate_id().to_string());
        if events
            .iter()
            .any(|event| event.aggregate_type() != key.0 || event.aggregate_id() != key.1)
        {
            return Err(StoreError::BatchSpansAggregates);
        }

        let mut inner = self.locked()?;
        let current = inner.heads.get(&key).copied().unwrap_or(0);
        if current != expected_sequence_number {
            return Err(StoreError::ConcurrencyConflict {
                aggregate_type: key.0,
                aggregate_id: key.1,
                expected: expected_sequence_number,
                current,
            });
        }

        let recorded_at = Utc::now();
        let mut records = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            let NewEvent { aggregate_type, aggregate_id, event_kind, schema_version, payload } =
                event;
            let record = EventRecord {
                id: Uuid::new_v4(),
                aggregate_type,
                aggregate_id,
                event_kind,
                schema_version,
                payload,
                sequence_number: expected_sequence_number + 1 + offset as SequenceNumber,
                global_sequence: inner.log.len() as GlobalSequence + 1,
                recorded_at,
            };
            inner.log.push(record.clone());
            records.push(record);
        }
        let appended = records.len() as SequenceNumber;
        inner.heads.insert(key, expected_sequence_number + appended);

        Ok(records)
    }

    async fn current_sequence(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<SequenceNumber, StoreError> {
        let inner = self.locked()?;
        let key = (aggregate_type.to_string(), aggregate_id.to_string());
        Ok(inner.heads.get(&key).copied().unwrap_or(0))
    }

    async fn events_for_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        from_sequence: SequenceNumber,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .log
            .iter()
            .filter(|record| {
                record.aggregate_type == aggregate_type
                    && record.aggregate_id == aggregate_id
                    && record.sequence_number >= from_sequence
            })
            .cloned()
            .collect())
    }

    fn all_events(
        &self,
        from_global_sequence: GlobalSequence,
    ) -> BoxStream<'_, Result<EventRecord, StoreError>> {
        struct Cursor {
            next: GlobalSequence,
            end: Option<GlobalSequence>,
            page: VecDeque<EventRecord>,
        }

        let store = self.clone();
        let cursor = Cursor {
            next: from_global_sequence.max(1),
            end: None,
            page: VecDeque::new(),
        };

        Box::pin(futures::stream::try_unfold(cursor, move |mut cursor| {
            let store = store.clone();
            async move {
                if let Some(record) = cursor.page.pop_front() {
                    return Ok(Some((record, cursor)));
                }

                let inner = store.locked()?;
                // The high watermark is captured on first poll: the stream is
                // bounded by what existed when iteration started, appends that
                // land afterwards are picked up by a follow-up call.
                let end = *cursor.end.get_or_insert(inner.log.len() as GlobalSequence);
                if cursor.next > end {
                    return Ok(None);
                }
                let upto = end.min(cursor.next + STREAM_PAGE_SIZE - 1);
                cursor
                    .page
                    .extend(inner.log[(cursor.next - 1) as usize..upto as usize].iter().cloned());
                drop(inner);
                cursor.next = upto + 1;

                Ok(cursor.page.pop_front().map(|record| (record, cursor)))
            }
        }))
    }
}
