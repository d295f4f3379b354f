//! Configuration module for Matrixon
//!
//! Tunables for gap resolution and logging. Every field has a default so a
//! partial configuration file is enough.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{MatrixonError, Result};

/// Gap resolution configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GapResolutionConfig {
    /// Maximum number of events requested per `/get_missing_events` call
    pub missing_events_limit: usize,

    /// Width of the bounded fetch pool, also the full-state fallback threshold
    pub concurrent_requests: usize,

    /// Timeout for a single remote request
    pub per_attempt_timeout_secs: u64,

    /// Overall deadline for resolving one event
    pub request_timeout_secs: u64,
}

impl Default for GapResolutionConfig {
    fn default() -> Self {
        Self {
            missing_events_limit: 20,
            concurrent_requests: 8,
            per_attempt_timeout_secs: 30,
            request_timeout_secs: 300,
        }
    }
}

impl GapResolutionConfig {
    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.per_attempt_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.missing_events_limit == 0 {
            return Err(MatrixonError::Config(
                "missing_events_limit must be greater than zero".into(),
            ));
        }
        if self.concurrent_requests == 0 {
            return Err(MatrixonError::Config(
                "concurrent_requests must be greater than zero".into(),
            ));
        }
        if self.per_attempt_timeout_secs > self.request_timeout_secs {
            return Err(MatrixonError::Config(format!(
                "per_attempt_timeout_secs ({}) exceeds request_timeout_secs ({})",
                self.per_attempt_timeout_secs, self.request_timeout_secs
            )));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    pub level: String,

    /// Log format (`pretty`, `compact` or `json`)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_gap_resolution_defaults() {
        let config = GapResolutionConfig::default();
        assert_eq!(config.missing_events_limit, 20);
        assert_eq!(config.concurrent_requests, 8);
        assert_eq!(config.per_attempt_timeout(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_gap_resolution_validation() {
        let mut config = GapResolutionConfig::default();
        config.concurrent_requests = 0;
        assert!(matches!(config.validate(), Err(MatrixonError::Config(_))));

        let mut config = GapResolutionConfig::default();
        config.missing_events_limit = 0;
        assert!(config.validate().is_err());

        let mut config = GapResolutionConfig::default();
        config.per_attempt_timeout_secs = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: GapResolutionConfig =
            serde_json::from_str(r#"{"concurrent_requests": 4}"#).unwrap();
        assert_eq!(config.concurrent_requests, 4);
        assert_eq!(config.missing_events_limit, 20);

        let logging: LoggingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(logging, LoggingConfig::default());
    }
}
