use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;

use everlog::store::InMemoryStore;
use everlog::{EventStore, NewEvent, StoreError};

use crate::fixtures::{user_created, user_renamed, UserCreated};

#[tokio::test]
async fn append_assigns_contiguous_sequence_numbers() {
    let store = InMemoryStore::new();

    let first = store.append(user_created("u1", "ada"), 0).await.unwrap();
    // Sequence numbers start from 1 and not from 0.
    assert_eq!(first.sequence_number, 1);
    assert_eq!(first.global_sequence, 1);
    assert_eq!(first.aggregate_type, "user");
    assert_eq!(first.aggregate_id, "u1");
    assert_eq!(first.event_kind, "user_created");
    assert_eq!(first.schema_version, 1);
    assert_eq!(first.payload_as::<UserCreated>().unwrap().name, "ada");

    let second = store.append(user_renamed("u1", "ada l."), 1).await.unwrap();
    assert_eq!(second.sequence_number, 2);
    assert_eq!(second.global_sequence, 2);
    assert!(second.recorded_at >= first.recorded_at);

    assert_eq!(store.current_sequence("user", "u1").await.unwrap(), 2);
    assert_eq!(store.current_sequence("user", "unknown").await.unwrap(), 0);
}

#[tokio::test]
async fn stale_expected_sequence_number_conflicts() {
    let store = InMemoryStore::new();

    store.append(user_created("u1", "ada"), 0).await.unwrap();

    let conflict = store.append(user_created("u1", "grace"), 0).await.unwrap_err();
    match conflict {
        StoreError::ConcurrencyConflict { aggregate_type, aggregate_id, expected, current } => {
            assert_eq!(aggregate_type, "user");
            assert_eq!(aggregate_id, "u1");
            assert_eq!(expected, 0);
            assert_eq!(current, 1);
        }
        other => panic!("expected concurrency conflict, got {other:?}"),
    }

    // The conflicting attempt persisted nothing.
    let events = store.events_for_aggregate("user", "u1", 1).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn concurrent_appends_for_one_new_aggregate_admit_exactly_one() {
    let store = Arc::new(InMemoryStore::new());

    let mut tasks = vec![];
    for i in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let jitter = rand::thread_rng().gen_range(0..5);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
            store.append(user_created("u1", &format!("writer-{i}")), 0).await
        }));
    }

    let mut successes = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(record) => {
                assert_eq!(record.sequence_number, 1);
                successes += 1;
            }
            Err(StoreError::ConcurrencyConflict { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(store.current_sequence("user", "u1").await.unwrap(), 1);
}

#[tokio::test]
async fn batch_append_is_contiguous_and_atomic() {
    let store = InMemoryStore::new();

    let records = store
        .append_all(
            vec![
                user_created("u1", "ada"),
                user_renamed("u1", "ada l."),
                user_renamed("u1", "ada lovelace"),
            ],
            0,
        )
        .await
        .unwrap();

    assert_eq!(records.iter().map(|r| r.sequence_number).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(records.iter().map(|r| r.global_sequence).collect::<Vec<_>>(), vec![1, 2, 3]);

    // A stale batch fails as a whole.
    let conflict = store
        .append_all(vec![user_renamed("u1", "x"), user_renamed("u1", "y")], 1)
        .await
        .unwrap_err();
    assert!(matches!(conflict, StoreError::ConcurrencyConflict { current: 3, .. }));
    assert_eq!(store.events_for_aggregate("user", "u1", 1).await.unwrap().len(), 3);

    // Batches are scoped to one aggregate instance.
    let mixed = store
        .append_all(vec![user_created("u2", "ada"), user_created("u3", "grace")], 0)
        .await
        .unwrap_err();
    assert!(matches!(mixed, StoreError::BatchSpansAggregates));

    // An empty batch is a no-op.
    assert!(store.append_all(vec![], 3).await.unwrap().is_empty());
}

#[tokio::test]
async fn all_events_streams_in_stable_global_order() {
    let store = InMemoryStore::new();

    store.append(user_created("u1", "ada"), 0).await.unwrap();
    store.append(user_created("u2", "grace"), 0).await.unwrap();
    store.append(user_renamed("u1", "ada l."), 1).await.unwrap();
    store.append(user_renamed("u2", "grace h."), 1).await.unwrap();

    let first_pass: Vec<i64> = store
        .all_events(1)
        .map(|record| record.unwrap().global_sequence)
        .collect()
        .await;
    assert_eq!(first_pass, vec![1, 2, 3, 4]);

    // Order is stable across repeated reads of an unchanged log.
    let second_pass: Vec<i64> = store
        .all_events(1)
        .map(|record| record.unwrap().global_sequence)
        .collect()
        .await;
    assert_eq!(first_pass, second_pass);

    // Resuming from a cursor yields the suffix only.
    let suffix: Vec<i64> = store
        .all_events(3)
        .map(|record| record.unwrap().global_sequence)
        .collect()
        .await;
    assert_eq!(suffix, vec![3, 4]);
}

#[tokio::test]
async fn all_events_pages_past_one_lock_window() {
    let store = InMemoryStore::new();

    // More events than one stream page so the cursor crosses page boundaries.
    let mut expected = 0;
    for i in 0..150 {
        store.append(user_renamed("u1", &format!("name-{i}")), expected).await.unwrap();
        expected += 1;
    }

    let globals: Vec<i64> = store
        .all_events(1)
        .map(|record| record.unwrap().global_sequence)
        .collect()
        .await;
    assert_eq!(globals, (1..=150).collect::<Vec<i64>>());
}

#[tokio::test]
async fn events_for_aggregate_filters_and_orders() {
    let store = InMemoryStore::new();

    store.append(user_created("u1", "ada"), 0).await.unwrap();
    store.append(user_created("u2", "grace"), 0).await.unwrap();
    store.append(user_renamed("u1", "ada l."), 1).await.unwrap();

    let events = store.events_for_aggregate("user", "u1", 1).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].sequence_number, 1);
    assert_eq!(events[1].sequence_number, 2);

    let from_second = store.events_for_aggregate("user", "u1", 2).await.unwrap();
    assert_eq!(from_second.len(), 1);
    assert_eq!(from_second[0].event_kind, "user_renamed");

    assert!(store.events_for_aggregate("user", "missing", 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn typed_event_construction_rejects_nothing_valid() {
    let event = NewEvent::new("user", "u1", &UserCreated { name: "ada".into() }).unwrap();
    assert_eq!(event.aggregate_type(), "user");
    assert_eq!(event.aggregate_id(), "u1");
    assert_eq!(event.event_kind(), "user_created");
}
