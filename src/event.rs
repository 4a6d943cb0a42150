use serde::de::DeserializeOwned;
use serde::Serialize;

/// A domain event that can be appended to the log.
///
/// `KIND` is the persisted discriminator: it routes records to registered
/// projections and selects the payload type on decode. `SCHEMA_VERSION` is the
/// version of the payload shape, to be bumped when the payload evolves so that
/// already persisted records stay readable.
pub trait Event: Serialize + DeserializeOwned {
    /// Wire discriminator of this event's semantic type.
    const KIND: &'static str;

    /// Version of the payload shape. Must be positive.
    const SCHEMA_VERSION: i32 = 1;
}
