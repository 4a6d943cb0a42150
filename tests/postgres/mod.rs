use std::time::Duration;

use futures::StreamExt;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use everlog::store::postgres::{PgStore, PgStoreBuilder};
use everlog::{EventStore, StoreError};

use crate::fixtures::{user_created, user_renamed};

#[sqlx::test]
async fn setup_database_test(pool: Pool<Postgres>) {
    let rows = sqlx::query("SELECT table_name FROM information_schema.columns WHERE table_name = $1")
        .bind("event_log")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert!(rows.is_empty());

    let store: PgStore = PgStoreBuilder::new(pool.clone())
        .try_build()
        .await
        .expect("Failed to create PgStore");
    assert_eq!(store.table_name(), "event_log");

    let rows = sqlx::query("SELECT table_name FROM information_schema.columns WHERE table_name = $1")
        .bind("event_log")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert!(!rows.is_empty());

    let rows = sqlx::query("SELECT indexname FROM pg_indexes WHERE tablename = $1")
        .bind("event_log")
        .fetch_all(&pool)
        .await
        .unwrap();
    // primary key, aggregate-sequence, global-sequence
    assert_eq!(rows.len(), 3);

    // Building twice is idempotent.
    let _: PgStore = PgStoreBuilder::new(pool.clone()).try_build().await.unwrap();
}

#[sqlx::test]
async fn append_assigns_sequences_and_detects_conflicts(pool: Pool<Postgres>) {
    let store: PgStore = PgStoreBuilder::new(pool).try_build().await.unwrap();

    let first = store.append(user_created("u1", "ada"), 0).await.unwrap();
    assert_eq!(first.sequence_number, 1);
    assert_eq!(first.global_sequence, 1);

    let second = store.append(user_renamed("u1", "ada l."), 1).await.unwrap();
    assert_eq!(second.sequence_number, 2);
    assert_eq!(second.global_sequence, 2);

    let conflict = store.append(user_created("u1", "grace"), 0).await.unwrap_err();
    assert!(matches!(
        conflict,
        StoreError::ConcurrencyConflict { expected: 0, current: 2, .. }
    ));

    assert_eq!(store.current_sequence("user", "u1").await.unwrap(), 2);
    assert_eq!(store.events_for_aggregate("user", "u1", 1).await.unwrap().len(), 2);
}

#[sqlx::test]
async fn conflicting_batch_consumes_no_global_sequence(pool: Pool<Postgres>) {
    let store: PgStore = PgStoreBuilder::new(pool).try_build().await.unwrap();

    store
        .append_all(vec![user_created("u1", "ada"), user_renamed("u1", "ada l.")], 0)
        .await
        .unwrap();

    let conflict = store
        .append_all(vec![user_renamed("u1", "x")], 0)
        .await
        .unwrap_err();
    assert!(matches!(conflict, StoreError::ConcurrencyConflict { .. }));

    // The rolled back attempt left no gap behind.
    let next = store.append(user_renamed("u1", "ada lovelace"), 2).await.unwrap();
    assert_eq!(next.global_sequence, 3);
}

#[sqlx::test]
async fn unique_violation_from_an_external_writer_is_a_conflict(pool: Pool<Postgres>) {
    let store: PgStore = PgStoreBuilder::new(pool.clone()).try_build().await.unwrap();
    store.append(user_created("u1", "ada"), 0).await.unwrap();

    // A writer bypassing the head counter holds an uncommitted row at the
    // sequence number the store is about to claim.
    let mut external = pool.begin().await.unwrap();
    sqlx::query(
        "INSERT INTO event_log \
         (id, aggregate_type, aggregate_id, event_kind, schema_version, payload, \
          sequence_number, global_sequence, recorded_at) \
         VALUES ($1, 'user', 'u1', 'user_renamed', 1, '{}', 2, 100, now())",
    )
    .bind(Uuid::new_v4())
    .execute(&mut *external)
    .await
    .unwrap();

    let appending = tokio::spawn({
        let store = store.clone();
        async move { store.append(user_renamed("u1", "ada l."), 1).await }
    });

    // The append passes its version check, then its insert waits on the
    // competing uncommitted row; the commit turns that wait into a unique
    // violation.
    tokio::time::sleep(Duration::from_millis(200)).await;
    external.commit().await.unwrap();

    let conflict = appending.await.unwrap().unwrap_err();
    assert!(matches!(
        conflict,
        StoreError::ConcurrencyConflict { expected: 1, current: 2, .. }
    ));
}

#[sqlx::test]
async fn all_events_streams_in_global_order(pool: Pool<Postgres>) {
    let store: PgStore = PgStoreBuilder::new(pool).try_build().await.unwrap();

    store.append(user_created("u1", "ada"), 0).await.unwrap();
    store.append(user_created("u2", "grace"), 0).await.unwrap();
    store.append(user_renamed("u1", "ada l."), 1).await.unwrap();

    let globals: Vec<i64> = store
        .all_events(1)
        .map(|record| record.unwrap().global_sequence)
        .collect()
        .await;
    assert_eq!(globals, vec![1, 2, 3]);

    let suffix: Vec<i64> = store
        .all_events(2)
        .map(|record| record.unwrap().global_sequence)
        .collect()
        .await;
    assert_eq!(suffix, vec![2, 3]);
}
