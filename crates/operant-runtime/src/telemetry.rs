//! Tracing setup
//!
//! `RUST_LOG` takes precedence over the configured filter.

use tracing_subscriber::EnvFilter;

use operant_core::{OperantError, OperantResult};

use crate::{LogFormat, RuntimeConfig};

/// Install the global tracing subscriber.
///
/// Returns `Ok(false)` if a subscriber was already installed.
pub fn init_tracing(config: &RuntimeConfig) -> OperantResult<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_filter)
            .map_err(|e| OperantError::Config(format!("invalid log filter: {}", e)))?,
    };

    let installed = match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_names(true)
            .try_init(),
    };
    Ok(installed.is_ok())
}
