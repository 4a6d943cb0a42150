use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Transaction};
use uuid::Uuid;

use crate::store::{EventRecord, EventStore, NewEvent, StoreError};
use crate::types::{GlobalSequence, SequenceNumber};

pub use builder::PgStoreBuilder;

mod builder;
mod migrations;
mod statements;

use statements::Statements;

// Postgres SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

/// Event representation on the event store table.
#[derive(sqlx::FromRow, Debug)]
struct DbEvent {
    id: Uuid,
    aggregate_type: String,
    aggregate_id: String,
    event_kind: String,
    schema_version: i32,
    payload: serde_json::Value,
    sequence_number: SequenceNumber,
    global_sequence: GlobalSequence,
    recorded_at: DateTime<Utc>,
}

impl From<DbEvent> for EventRecord {
    fn from(row: DbEvent) -> Self {
        Self {
            id: row.id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_kind: row.event_kind,
            schema_version: row.schema_version,
            payload: row.payload,
            sequence_number: row.sequence_number,
            global_sequence: row.global_sequence,
            recorded_at: row.recorded_at,
        }
    }
}

/// Postgres implementation of the [`EventStore`], persisting all aggregates
/// in a single `event_log` table.
///
/// The store is protected by an [`Arc`] that allows it to be cloneable still
/// having the same memory reference. Build it through [`PgStoreBuilder`],
/// which runs the idempotent schema migrations at startup.
///
/// Appends run in one transaction that first advances the single-row head
/// counter: the row lock serializes appends, which keeps `global_sequence`
/// gap-free (a rolled back transaction releases the lock without consuming a
/// number) and makes the subsequent expected-version check race-free. The
/// unique index on `(aggregate_type, aggregate_id, sequence_number)` is the
/// durable backstop for the same invariant: a unique violation raised by a
/// writer outside the head-lock path surfaces as a
/// [`StoreError::ConcurrencyConflict`] too, not as an infrastructure failure.
pub struct PgStore {
    inner: Arc<InnerPgStore>,
}

struct InnerPgStore {
    pool: Pool<Postgres>,
    statements: Statements,
}

impl PgStore {
    /// Returns the name of the event store table.
    pub fn table_name(&self) -> &str {
        self.inner.statements.table_name()
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn append(
        &self,
        event: NewEvent,
        expected_sequence_number: SequenceNumber,
    ) -> Result<EventRecord, StoreError> {
        let mut records = self.append_all(vec![event], expected_sequence_number).await?;
        records
            .pop()
            .ok_or_else(|| StoreError::StorageUnavailable("empty append result".into()))
    }

    #[tracing::instrument(skip_all, err)]
    async fn append_all(
        &self,
        events: Vec<NewEvent>,
        expected_sequence_number: SequenceNumber,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let Some(first) = events.first() else {
            return Ok(vec![]);
        };
        let aggregate_type = first.aggregate_type().to_string();
        let aggregate_id = first.aggregate_id().to_string();
        if events
            .iter()
            .any(|event| event.aggregate_type() != aggregate_type || event.aggregate_id() != aggregate_id)
        {
            return Err(StoreError::BatchSpansAggregates);
        }

        let mut transaction: Transaction<Postgres> = self.inner.pool.begin().await?;

        let (last_global,): (GlobalSequence,) =
            sqlx::query_as(self.inner.statements.advance_global())
                .bind(events.len() as i64)
                .fetch_one(&mut *transaction)
                .await?;

        let (current,): (SequenceNumber,) =
            sqlx::query_as(self.inner.statements.current_sequence())
                .bind(aggregate_type.as_str())
                .bind(aggregate_id.as_str())
                .fetch_one(&mut *transaction)
                .await?;

        if current != expected_sequence_number {
            // Dropping the transaction rolls it back, releasing the head row
            // without consuming global sequence numbers.
            return Err(StoreError::ConcurrencyConflict {
                aggregate_type,
                aggregate_id,
                expected: expected_sequence_number,
                current,
            });
        }

        let recorded_at: DateTime<Utc> = Utc::now();
        let first_global = last_global - events.len() as GlobalSequence + 1;
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
                global_sequence: first_global + offset as GlobalSequence,
                recorded_at,
            };

            let inserted = sqlx::query(self.inner.statements.insert())
                .bind(record.id)
                .bind(record.aggregate_type.as_str())
                .bind(record.aggregate_id.as_str())
                .bind(record.event_kind.as_str())
                .bind(record.schema_version)
                .bind(Json(&record.payload))
                .bind(record.sequence_number)
                .bind(record.global_sequence)
                .bind(record.recorded_at)
                .execute(&mut *transaction)
                .await;

            if let Err(error) = inserted {
                if is_unique_violation(&error) {
                    // A competing writer claimed this sequence number after
                    // our version check. Dropping the transaction rolls it
                    // back; the conflict carries the freshly committed version.
                    drop(transaction);
                    let current = self
                        .current_sequence(&record.aggregate_type, &record.aggregate_id)
                        .await?;
                    return Err(StoreError::ConcurrencyConflict {
                        aggregate_type: record.aggregate_type,
                        aggregate_id: record.aggregate_id,
                        expected: expected_sequence_number,
                        current,
                    });
                }
                return Err(error.into());
            }

            records.push(record);
        }

        transaction.commit().await?;

        Ok(records)
    }

    async fn current_sequence(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<SequenceNumber, StoreError> {
        let (current,): (SequenceNumber,) =
            sqlx::query_as(self.inner.statements.current_sequence())
                .bind(aggregate_type)
                .bind(aggregate_id)
                .fetch_one(&self.inner.pool)
                .await?;

        Ok(current)
    }

    async fn events_for_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        from_sequence: SequenceNumber,
    ) -> Result<Vec<EventRecord>, StoreError> {
        Ok(sqlx::query_as::<_, DbEvent>(self.inner.statements.by_aggregate())
            .bind(aggregate_type)
            .bind(aggregate_id)
            .bind(from_sequence.max(1))
            .fetch_all(&self.inner.pool)
            .await?
            .into_iter()
            .map(EventRecord::from)
            .collect())
    }

    fn all_events(
        &self,
        from_global_sequence: GlobalSequence,
    ) -> BoxStream<'_, Result<EventRecord, StoreError>> {
        Box::pin(
            sqlx::query_as::<_, DbEvent>(self.inner.statements.select_all())
                .bind(from_global_sequence.max(1))
                .fetch(&self.inner.pool)
                .map(|row| row.map(EventRecord::from).map_err(StoreError::from)),
        )
    }
}

/// Debug implementation for [`PgStore`]. It just shows the statements, that
/// are the only thing that might be useful to debug.
impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore")
            .field("statements", &self.inner.statements)
            .finish()
    }
}

impl Clone for PgStore {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}
