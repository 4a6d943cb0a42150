mod bus;
mod event;
mod query;
mod registry;
mod replay;
pub mod store;

pub mod types {
    /// Position of an event within its aggregate's history. Starts at 1, gap-free.
    pub type SequenceNumber = i64;
    /// Position of an event within the whole log. Starts at 1, gap-free.
    pub type GlobalSequence = i64;
}

pub use crate::bus::{EventBus, EventHandler, HandlerError, HandlerFailure, Publication};
pub use crate::event::Event;
pub use crate::query::EventQuery;
pub use crate::registry::{
    Projection, ProjectionError, ProjectionFailure, ProjectionRegistry, ProjectionRegistryBuilder,
};
pub use crate::replay::{CancellationFlag, ReplayCursor, ReplayOptions, ReplayReport, Replayer};
pub use crate::store::{EventRecord, EventStore, NewEvent, StoreError};
