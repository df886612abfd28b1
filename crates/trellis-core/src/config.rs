//! Engine configuration loader.
//!
//! Reads an optional `trellis.toml` and deserializes it into
//! [`EngineConfig`]. `load_engine_config` falls back to defaults when the
//! file is missing or malformed; `parse_engine_config` is the strict form.

use std::path::Path;

use thiserror::Error;
use trellis_types::config::EngineConfig;

/// Conventional config file name.
pub const CONFIG_FILE_NAME: &str = "trellis.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse engine config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{field} must be at least 1")]
    Invalid { field: &'static str },
}

/// Parse engine configuration from TOML, rejecting zero limits.
pub fn parse_engine_config(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(content)?;
    if config.max_steps == 0 {
        return Err(ConfigError::Invalid { field: "max_steps" });
    }
    if config.event_capacity == 0 {
        return Err(ConfigError::Invalid {
            field: "event_capacity",
        });
    }
    Ok(config)
}

/// Load engine configuration from `path`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No engine config at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match parse_engine_config(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Invalid engine config {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}
