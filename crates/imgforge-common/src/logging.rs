//! Tracing subscriber setup for processes embedding imgforge.

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::error::{ForgeError, Result};

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter.
///
/// # Errors
///
/// Returns `ForgeError::Config` if the filter is invalid or a global
/// subscriber is already installed.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(directives),
        Err(_) => EnvFilter::try_new(&config.filter),
    }
    .map_err(|e| ForgeError::Config {
        message: format!("invalid log filter: {e}"),
    })?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ForgeError::Config {
        message: format!("tracing subscriber already installed: {e}"),
    })
}
