//! Error types for Matrixon
//!
//! This module defines the error taxonomy shared by every crate of the
//! missing-state resolution engine. Each variant that concerns a single event
//! carries the event ID (and room ID where one is known) so callers can log
//! and trace without re-deriving context.

use ruma::{OwnedEventId, OwnedRoomId, OwnedServerName};
use thiserror::Error;
use tracing::{error, warn};

/// Matrixon error types
#[derive(Debug, Error)]
pub enum MatrixonError {
    /// No candidate server could supply the missing history for an event.
    /// The event is dropped until conditions change; retrying is up to the caller.
    #[error("Unable to get prev_events for event {event_id}: {reason}")]
    MissingPrevEvents {
        event_id: OwnedEventId,
        reason: String,
    },

    /// A fetched event failed signature verification and was discarded
    #[error("Unable to verify signature of event {event_id}: {reason}")]
    SignatureVerification {
        event_id: OwnedEventId,
        reason: String,
    },

    /// Zero predecessor states were found for a boundary that is not a room-creation event
    #[error("Inconsistent gap state at {event_id} in {room_id}: expected {expected} states but got {found}")]
    InconsistentGapState {
        event_id: OwnedEventId,
        room_id: OwnedRoomId,
        expected: usize,
        found: usize,
    },

    /// The state-resolution oracle returned an error
    #[error("State resolution failed in {room_id}: {reason}")]
    StateResolution {
        room_id: OwnedRoomId,
        reason: String,
    },

    /// An auth event needed to authorise an event is missing and could not be fetched
    #[error("Missing auth event {auth_event_id} for event {event_id} and failed to look it up: {reason}")]
    MissingAuthEvent {
        event_id: OwnedEventId,
        auth_event_id: OwnedEventId,
        reason: String,
    },

    /// The event failed authorisation; non-fatal for the batch it belongs to
    #[error("Event {event_id} was rejected: {reason}")]
    Rejected {
        event_id: OwnedEventId,
        reason: String,
    },

    /// A remote server failed to answer a federation request
    #[error("Federation error from {server}: {reason}")]
    Federation {
        server: OwnedServerName,
        reason: String,
    },

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Local graph / storage error
    #[error("Database error: {0}")]
    Database(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Malformed or inconsistent event data
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for Matrixon operations
pub type Result<T> = std::result::Result<T, MatrixonError>;

impl MatrixonError {
    /// Creates a new federation error for `server`
    pub fn federation(server: impl Into<OwnedServerName>, reason: impl Into<String>) -> Self {
        Self::Federation {
            server: server.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new rejection for `event_id`
    pub fn rejected(event_id: impl Into<OwnedEventId>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            event_id: event_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Creates a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Whether this is a per-event rejection that must not abort a batch
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// Whether this error came from an expired deadline or timed out transport
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether this error is a signature verification failure
    pub fn is_signature_failure(&self) -> bool {
        matches!(self, Self::SignatureVerification { .. })
    }

    /// Logs the error with appropriate level and context
    pub fn log(&self) {
        match self {
            Self::Rejected { event_id, reason } => {
                warn!("⚠️ Event {} rejected: {}", event_id, reason)
            }
            Self::SignatureVerification { event_id, reason } => {
                warn!("⚠️ Bad signature on {}: {}", event_id, reason)
            }
            Self::Federation { server, reason } => {
                warn!("⚠️ Federation error from {}: {}", server, reason)
            }
            Self::Timeout(msg) => warn!("⚠️ Operation timed out: {}", msg),
            other => error!("❌ {}", other),
        }
    }
}

impl From<serde_json::Error> for MatrixonError {
    fn from(err: serde_json::Error) -> Self {
        MatrixonError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for MatrixonError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        MatrixonError::Timeout(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::{owned_event_id, owned_room_id, owned_server_name};
    use test_log::test;

    #[test]
    fn test_error_display() {
        let err = MatrixonError::MissingPrevEvents {
            event_id: owned_event_id!("$e:example.com"),
            reason: "no servers".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unable to get prev_events for event $e:example.com: no servers"
        );

        let err = MatrixonError::InconsistentGapState {
            event_id: owned_event_id!("$e:example.com"),
            room_id: owned_room_id!("!r:example.com"),
            expected: 2,
            found: 0,
        };
        assert!(err.to_string().contains("expected 2 states but got 0"));

        let err = MatrixonError::federation(owned_server_name!("remote.test"), "boom");
        assert_eq!(err.to_string(), "Federation error from remote.test: boom");
    }

    #[test]
    fn test_error_classification() {
        let rejected = MatrixonError::rejected(owned_event_id!("$e:example.com"), "forbidden");
        assert!(rejected.is_rejection());
        assert!(!rejected.is_timeout());

        let timeout = MatrixonError::timeout("deadline");
        assert!(timeout.is_timeout());
        assert!(!timeout.is_rejection());

        let sig = MatrixonError::SignatureVerification {
            event_id: owned_event_id!("$e:example.com"),
            reason: "bad key".to_string(),
        };
        assert!(sig.is_signature_failure());
    }

    #[test]
    fn test_error_conversion_from_serde() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: MatrixonError = json_err.into();
        assert!(err.to_string().contains("Serialization error"));
    }
}
