use thiserror::Error;

/// Errors surfaced to callers of the bus's public API.
///
/// Consumer-side failures (deserialization, subscriber panics, handler
/// errors for non-request messages) never reach this type — they are
/// logged and swallowed by the partition processor so that the partition
/// keeps progressing (see `bus-kafka`'s `ConsumerProcessor`).
#[derive(Error, Debug)]
pub enum BusError {
    #[error("invalid bus configuration: {0}")]
    InvalidConfiguration(String),

    #[error("publish failed (code={code}): {reason}")]
    PublishFailed { code: i32, reason: String },

    #[error("request timed out")]
    RequestTimeout,

    #[error("request cancelled")]
    RequestCancelled,

    #[error("handler faulted: {0}")]
    HandlerFaulted(String),

    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    #[error("bus is shutting down")]
    BusShutdown,
}

impl BusError {
    pub fn publish_failed(code: i32, reason: impl Into<String>) -> Self {
        Self::PublishFailed { code, reason: reason.into() }
    }
}
