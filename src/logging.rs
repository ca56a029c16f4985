//! Tracing initialization.
//!
//! Installs a `tracing-subscriber` fmt subscriber configured from
//! [`LoggingConfig`]. `RUST_LOG`, when set, takes precedence over the configured
//! level:
//!
//! ```bash
//! RUST_LOG=exposure_engine=debug exposure_sim --duration 2.5
//! ```

use crate::config::LoggingConfig;
use crate::error::{EngineError, EngineResult};
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` if present, the configured level otherwise.
pub fn env_filter(config: &LoggingConfig) -> EngineResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            EngineError::Configuration(format!("invalid log level '{}': {e}", config.level))
        }),
    }
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` if a subscriber was already installed, which happens
/// when an embedding application or a test harness set one up first.
pub fn init(config: &LoggingConfig) -> EngineResult<bool> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    Ok(installed)
}
