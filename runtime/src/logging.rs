//! Logger setup.

use crate::error::ConfigError;
use tracing_subscriber::EnvFilter;

/// Map a configured level name to a tracing filter directive.
pub fn directive(level: &str) -> Result<&'static str, ConfigError> {
    match level.to_ascii_lowercase().as_str() {
        "debug" => Ok("debug"),
        "release" => Ok("info"),
        "error" | "fatal" => Ok("error"),
        _ => Err(ConfigError::UnknownLogLevel(level.to_string())),
    }
}

/// Install the global fmt subscriber. `RUST_LOG` wins over `level` when set.
pub fn init(level: &str) -> Result<(), ConfigError> {
    let directive = directive(level)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| ConfigError::Logger(e.to_string()))
}
