//! Error types for the bus.

use store::StoreError;

/// Errors surfaced to callers of the event bus and the queue bus.
///
/// Recoverable conditions inside the consumer loops (missing payloads,
/// jobs with no listener, transient store failures) are logged and
/// absorbed; they never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid bus config: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("bus is closed")]
    Closed,
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;
