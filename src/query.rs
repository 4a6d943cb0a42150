use crate::store::{EventRecord, EventStore, StoreError};

/// Read-only facade over an [`EventStore`] for external callers such as audit
/// tools and debugging views.
pub struct EventQuery<S> {
    store: S,
}

impl<S> EventQuery<S>
where
    S: EventStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns the full history of one aggregate in ascending
    /// `sequence_number` order, empty when the aggregate has no events.
    pub async fn events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.store.events_for_aggregate(aggregate_type, aggregate_id, 1).await
    }
}
