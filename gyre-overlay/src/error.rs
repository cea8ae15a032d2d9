//! The error taxonomy.
//!
//! Transport-level failures (timeouts, dead links) are recovered inside the
//! runtime; protocol-level outcomes (rejection, nak) bubble to the calling
//! algorithm, which retries with backoff or escalates. End users see a
//! value, a `Rejected`, or a `Timeout` — everything else is internal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of reasons a receiver may reject a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// Capabilities cannot produce any connection.
    Constraint,
    /// Requestor asked for relay but has relay disabled.
    NoRelayIsOn,
    /// Accept side has relay disabled.
    EnableRelayIsOff,
    /// The key is already present in the ring.
    DuplicatedKey,
    /// No node owns exactly this key.
    NoExactKey,
    /// The ring would degenerate to a single node.
    Singleton,
    /// A finger-table update walked past its requester.
    Circulated,
    /// The finger-table target is unchanged.
    NotChanged,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::Constraint => "CONSTRAINT",
            RejectReason::NoRelayIsOn => "NO_RELAY_IS_ON",
            RejectReason::EnableRelayIsOff => "ENABLE_RELAY_IS_OFF",
            RejectReason::DuplicatedKey => "DUPLICATED_KEY",
            RejectReason::NoExactKey => "NO_EXACT_KEY",
            RejectReason::Singleton => "SINGLETON",
            RejectReason::Circulated => "CIRCULATED",
            RejectReason::NotChanged => "NOT_CHANGED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum OverlayError {
    /// A raw establishment, ack, or reply deadline expired.
    #[error("timeout: {0}")]
    Timeout(&'static str),

    /// Send on a peer connection that is not connected.
    #[error("not connected")]
    NotConnected,

    /// The peer connection died while a request was in flight.
    #[error("disconnected")]
    Disconnected,

    /// The receiver denied the request.
    #[error("rejected: {0}")]
    Rejected(RejectReason),

    /// Protocol nak or lost race; the caller should retry with backoff.
    #[error("retriable: {0}")]
    Retriable(String),

    /// Decoded a record whose tag is not registered.
    #[error("unknown message tag: {0}")]
    UnknownTag(String),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation. Not expected in normal operation.
    #[error("internal: {0}")]
    Internal(String),
}

impl OverlayError {
    /// Whether the calling algorithm should retry after backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, OverlayError::Retriable(_))
    }
}

pub type Result<T> = std::result::Result<T, OverlayError>;
