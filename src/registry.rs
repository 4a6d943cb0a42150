use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use crate::store::EventRecord;
use crate::types::GlobalSequence;

/// A `Projection` consumes persisted events to maintain a derived,
/// read-optimized model.
///
/// Projections receive every event at least once: once from the publish path
/// and again on every replay covering the event. Implementations must
/// therefore be idempotent, overwriting rather than accumulating state, and
/// must not perform business-logic side effects.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Applies one event to the read model.
    async fn project(&self, record: &EventRecord) -> Result<(), ProjectionError>;

    /// The name of the projection. By default this is the type name, but it
    /// can be overridden to provide a custom name. Used in tracing spans and
    /// failure reports to identify the projection being run.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Error raised by a [`Projection`].
///
/// Projection errors are captured and reported, never unwound through the
/// publish call: persistence success is independent of projection health.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ProjectionError(Box<dyn std::error::Error + Send + Sync>);

impl ProjectionError {
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(source.into())
    }
}

/// One captured projection failure, as carried in a [`crate::Publication`]
/// or a [`crate::ReplayReport`].
#[derive(Clone, Debug)]
pub struct ProjectionFailure {
    pub projection: &'static str,
    pub event_kind: String,
    pub global_sequence: GlobalSequence,
    pub error: String,
}

/// Builder for a [`ProjectionRegistry`], used by view-updater modules at
/// process start.
#[derive(Default)]
pub struct ProjectionRegistryBuilder {
    routes: HashMap<String, Vec<Arc<dyn Projection>>>,
}

impl ProjectionRegistryBuilder {
    /// Adds `projection` to the ordered set registered for `event_kind`.
    ///
    /// Insertion order determines invocation order when multiple projections
    /// match the same kind. Registering the identical projection instance for
    /// the identical kind twice is a no-op, tolerating repeated module
    /// initialization.
    pub fn register(mut self, event_kind: impl Into<String>, projection: Arc<dyn Projection>) -> Self {
        let registered = self.routes.entry(event_kind.into()).or_default();
        if !registered.iter().any(|existing| Arc::ptr_eq(existing, &projection)) {
            registered.push(projection);
        }
        self
    }

    pub fn build(self) -> ProjectionRegistry {
        ProjectionRegistry { routes: self.routes }
    }
}

/// Immutable mapping from event kind to the ordered set of registered
/// [`Projection`]s. Built once at startup, read-only thereafter.
#[derive(Default)]
pub struct ProjectionRegistry {
    routes: HashMap<String, Vec<Arc<dyn Projection>>>,
}

impl ProjectionRegistry {
    pub fn builder() -> ProjectionRegistryBuilder {
        ProjectionRegistryBuilder::default()
    }

    /// Returns the projections registered for `event_kind`, in registration
    /// order. Unmatched kinds yield an empty slice, not an error: such events
    /// are simply not projected.
    pub fn projections_for(&self, event_kind: &str) -> &[Arc<dyn Projection>] {
        self.routes.get(event_kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Invokes every projection registered for the record's kind, in
    /// registration order, isolating failures: a failing projection is logged
    /// and reported but never blocks its siblings.
    ///
    /// Both the publish path and replay dispatch through here, so the two
    /// have identical semantics.
    pub async fn dispatch(&self, record: &EventRecord) -> Vec<ProjectionFailure> {
        let mut failures = vec![];

        for projection in self.projections_for(&record.event_kind) {
            let span = tracing::debug_span!(
                "everlog.projection",
                event_id = %record.id,
                aggregate_id = %record.aggregate_id,
                projection = projection.name()
            );

            if let Err(error) = projection.project(record).instrument(span).await {
                tracing::error!({
                    event_id = %record.id,
                    aggregate_id = %record.aggregate_id,
                    projection = projection.name(),
                    error = ?error,
                }, "projection failed to apply event");

                failures.push(ProjectionFailure {
                    projection: projection.name(),
                    event_kind: record.event_kind.clone(),
                    global_sequence: record.global_sequence,
                    error: error.to_string(),
                });
            }
        }

        failures
    }
}
