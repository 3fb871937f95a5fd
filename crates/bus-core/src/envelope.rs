use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque token pairing a request with its response.
///
/// Unique within the process lifetime (backed by a v4 UUID). Carried in the
/// envelope header, never inspected by the bus beyond equality comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Header block carried alongside a request/response payload.
///
/// For transports whose wire format supports message headers (Kafka record
/// headers) this travels out-of-band; for transports that don't, it is
/// prepended to the body as a length-prefixed block (`bus-kafka` uses the
/// former — Kafka record headers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub correlation_id: CorrelationId,
    /// Topic on which the response is expected. Present on requests, absent
    /// on responses (the response processor already knows its own topic).
    pub reply_to: Option<String>,
    /// Sender-side deadline, ms since epoch. Informational only — the
    /// authoritative timeout is enforced by the `PendingRequest` deadline on
    /// the originating side, not by the receiver.
    pub expires_at_ms: Option<i64>,
    /// Present iff the handler faulted; carries a human-readable message.
    pub fault: Option<String>,
}

impl EnvelopeHeader {
    pub fn for_request(reply_to: impl Into<String>, expires_at_ms: i64) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            reply_to: Some(reply_to.into()),
            expires_at_ms: Some(expires_at_ms),
            fault: None,
        }
    }

    pub fn for_response(correlation_id: CorrelationId, fault: Option<String>) -> Self {
        Self {
            correlation_id,
            reply_to: None,
            expires_at_ms: None,
            fault,
        }
    }

    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }
}
