use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use crate::registry::{ProjectionFailure, ProjectionRegistry};
use crate::store::{EventRecord, EventStore, NewEvent, StoreError};
use crate::types::{GlobalSequence, SequenceNumber};

/// Business-logic event handler, the seam towards the external
/// command-handling framework.
///
/// Handlers run synchronously on the publish path, in registration order,
/// and only ever see durably persisted events. A handler failure is reported
/// to the publisher but never rolls back the event: the log is the source of
/// truth, the handler's work is a downstream concern to retry independently.
/// Replay never invokes these.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one persisted event, performing a side effect or follow-up
    /// command.
    async fn handle(&self, record: &EventRecord) -> Result<(), HandlerError>;

    /// The name of the handler. By default this is the type name, used in
    /// tracing spans and failure reports.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Error raised by an [`EventHandler`]. Captured into the [`Publication`],
/// never unwound through `publish`.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(Box<dyn std::error::Error + Send + Sync>);

impl HandlerError {
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(source.into())
    }
}

/// One captured business-handler failure.
#[derive(Clone, Debug)]
pub struct HandlerFailure {
    pub handler: &'static str,
    pub event_kind: String,
    pub global_sequence: GlobalSequence,
    pub error: String,
}

/// Outcome of a successful publish: the persisted records plus the captured,
/// non-fatal handler and projection failures.
///
/// A publish call succeeds if and only if persistence succeeded; read-model
/// staleness caused by the reported failures is recoverable via replay.
#[derive(Debug)]
pub struct Publication {
    /// The persisted records, in append order.
    pub records: Vec<EventRecord>,
    pub handler_failures: Vec<HandlerFailure>,
    pub projection_failures: Vec<ProjectionFailure>,
}

impl Publication {
    /// True when every handler and projection processed every record.
    pub fn is_clean(&self) -> bool {
        self.handler_failures.is_empty() && self.projection_failures.is_empty()
    }
}

/// The store-and-dispatch bus: the publish path invoked by application
/// command handlers after a command mutated an aggregate.
///
/// `publish` appends first and dispatches second, so handlers and projections
/// only ever observe durably persisted events. The bus is an explicitly
/// constructed instance owned by process wiring code and passed by reference
/// to anything that publishes; it holds no global state.
pub struct EventBus<S> {
    store: S,
    registry: Arc<ProjectionRegistry>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl<S> EventBus<S>
where
    S: EventStore,
{
    pub fn new(store: S, registry: Arc<ProjectionRegistry>) -> Self {
        Self { store, registry, handlers: vec![] }
    }

    /// Set the business-logic handler list.
    pub fn with_handlers(self, handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        Self { handlers, ..self }
    }

    /// Add a single business-logic handler.
    pub fn add_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Returns the internal event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persists one event, then dispatches it to the registered business
    /// handlers and to the matching projections.
    ///
    /// # Errors
    ///
    /// Fails with the append's [`StoreError`] when persistence fails; in that
    /// case no handler or projection is invoked.
    #[tracing::instrument(skip_all, fields(aggregate_id = %event.aggregate_id()), err)]
    pub async fn publish(
        &self,
        event: NewEvent,
        expected_sequence_number: SequenceNumber,
    ) -> Result<Publication, StoreError> {
        let record = self.store.append(event, expected_sequence_number).await?;
        Ok(self.dispatch(vec![record]).await)
    }

    /// Persists multiple events emitted by one aggregate from one command as
    /// a contiguous sequence range, all-or-nothing, then dispatches them in
    /// append order.
    pub async fn publish_batch(
        &self,
        events: Vec<NewEvent>,
        expected_sequence_number: SequenceNumber,
    ) -> Result<Publication, StoreError> {
        let records = self.store.append_all(events, expected_sequence_number).await?;
        Ok(self.dispatch(records).await)
    }

    async fn dispatch(&self, records: Vec<EventRecord>) -> Publication {
        let mut handler_failures = vec![];
        let mut projection_failures = vec![];

        for record in &records {
            for handler in &self.handlers {
                let span = tracing::debug_span!(
                    "everlog.event_handler",
                    event_id = %record.id,
                    aggregate_id = %record.aggregate_id,
                    handler = handler.name()
                );

                if let Err(error) = handler.handle(record).instrument(span).await {
                    tracing::error!({
                        event_id = %record.id,
                        aggregate_id = %record.aggregate_id,
                        handler = handler.name(),
                        error = ?error,
                    }, "event handler failed to handle event");

                    handler_failures.push(HandlerFailure {
                        handler: handler.name(),
                        event_kind: record.event_kind.clone(),
                        global_sequence: record.global_sequence,
                        error: error.to_string(),
                    });
                }
            }

            projection_failures.extend(self.registry.dispatch(record).await);
        }

        Publication { records, handler_failures, projection_failures }
    }
}
