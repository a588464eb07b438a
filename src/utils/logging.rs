//! Structured logging setup.
//!
//! Initializes a `tracing-subscriber` pipeline from [`LoggingConfig`]:
//! console output at the configured level, optionally JSON-formatted. The
//! `RUST_LOG` environment variable overrides the configured level when set.

use crate::config::LoggingConfig;
use crate::error::{Result, UaError};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Call once at process start; a second call
/// fails because the global subscriber is already set.
pub fn init(config: &LoggingConfig) -> Result<()> {
    if !config.log_to_console {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| UaError::Config(format!("failed to install subscriber: {e}")))
}
