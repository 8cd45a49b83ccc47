//! tandem configuration.
//!
//! TOML-based settings for the relay, the sync client, and logging. Every
//! section uses serde defaults so a partial file (or no file) works.

pub mod schema;
pub mod toml_loader;
pub mod validation;

pub use schema::{ClientSettings, LogLevel, LoggingConfig, RelaySettings, TandemConfig};
pub use toml_loader::{
    create_default_config, default_config_path, load_default, load_from_path, CONFIG_ENV_VAR,
};

use tandem_common::ConfigError;

/// Load config from the platform default path and validate it.
pub fn load_config() -> Result<TandemConfig, ConfigError> {
    let config = toml_loader::load_default()?;
    validation::validate(&config)?;
    Ok(config)
}

/// Serialize a config to a pretty-printed JSON string.
pub fn config_to_json(config: &TandemConfig) -> String {
    serde_json::to_string_pretty(config)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize config: {e}\"}}"))
}
