//! Logging setup
//!
//! Installs a global `tracing` subscriber. `RUST_LOG` overrides the
//! configured level when present.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{AgidError, Result};

/// Install the global subscriber.
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place and return `Ok(())`.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| AgidError::Config(format!("Invalid log level '{}': {}", config.level, e)))?;

    let installed = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };

    if installed.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
    Ok(())
}
