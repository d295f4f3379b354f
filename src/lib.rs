// =============================================================================
// Matrixon Matrix NextServer - Library Crate
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Host-process bootstrap for the gap resolution engine: layered
//   configuration (TOML file + MATRIXON_ environment variables) and tracing
//   initialisation, plus re-exports of the workspace crates.
//
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Re-export common types
pub use ruma;
pub use tokio;
pub use tracing;

// Re-export workspace crates
pub use matrixon_common as common;
pub use matrixon_core as core;
pub use matrixon_rooms as rooms;

pub use matrixon_core::{GapResolutionConfig, LoggingConfig};
pub use matrixon_rooms::{RoomMutexMap, Service};

const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Configuration for a process embedding the gap resolver
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server_name: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub gap_resolution: GapResolutionConfig,
}

impl Config {
    /// Reads `path`, then applies `MATRIXON_` environment overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `MATRIXON_GAP_RESOLUTION__CONCURRENT_REQUESTS=4`.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config: Config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("MATRIXON_").split("__"))
            .extract()
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;

        config.validate()?;
        info!("✅ Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_name.trim().is_empty() {
            bail!("server_name must not be empty");
        }
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            bail!(
                "unknown log format {:?}, expected one of {:?}",
                self.logging.format,
                LOG_FORMATS
            );
        }
        self.gap_resolution
            .validate()
            .context("invalid [gap_resolution] section")?;
        Ok(())
    }
}

/// Installs the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("invalid log level {:?}", config.level))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format.as_str() {
        "json" => registry.with(fmt::layer().json()).try_init(),
        "compact" => registry.with(fmt::layer().compact()).try_init(),
        "pretty" => registry.with(fmt::layer().pretty()).try_init(),
        other => bail!("unknown log format {other:?}"),
    };
    result.context("a global tracing subscriber is already installed")?;

    info!("🔧 Logging initialised ({} format)", config.format);
    Ok(())
}
