//! Utility functions for Matrixon
//!
//! Deadline bookkeeping for remote requests and request ID generation.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// An absolute point in time by which a resolution must finish.
///
/// Backed by the tokio clock so paused-time tests can drive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Time left, zero once expired
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Timeout for one remote attempt: `per_attempt`, capped by the time left
    pub fn attempt_timeout(&self, per_attempt: Duration) -> Duration {
        let remaining = self.remaining();
        if remaining < per_attempt {
            debug!("🔧 Attempt timeout capped to {:?} by deadline", remaining);
        }
        per_attempt.min(remaining)
    }
}

/// Generate a unique request identifier for tracing spans
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
