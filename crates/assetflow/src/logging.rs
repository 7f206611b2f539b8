//! Global subscriber setup for the daemon.
//!
//! `RUST_LOG` takes priority over the configured level. Records emitted
//! through the `log` facade are bridged into the same subscriber.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

pub fn build_env_filter(default_directive: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_directive).map_err(|e| LoggingError::InvalidFilter {
        directive: default_directive.to_string(),
        reason: e.to_string(),
    })
}

/// Installs the global subscriber. Call once, early in `main`.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_env_filter(&config.level)?;

    let result = match config.format {
        LogFormat::Text => tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true)),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_current_span(true)),
        ),
    };
    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    tracing_log::LogTracer::init().map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}
