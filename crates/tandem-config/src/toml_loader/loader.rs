//! Reading and validating `config.toml`.

use std::io::ErrorKind;
use std::path::Path;

use tandem_common::ConfigError;
use tracing::{info, warn};

use super::paths::{create_default_config, default_config_path, io_error};
use crate::schema::TandemConfig;
use crate::validation;

/// Parse the TOML file at `path`. Missing keys take their defaults.
///
/// Out-of-range values are logged rather than rejected so a typo in one
/// section does not keep the relay from starting; [`crate::load_config`]
/// is the strict variant.
pub fn load_from_path(path: &Path) -> Result<TandemConfig, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound(path.to_path_buf()))
        }
        Err(e) => return Err(io_error("read", path, e)),
    };

    let config: TandemConfig = toml::from_str(&content)
        .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;

    if let Err(e) = validation::validate(&config) {
        warn!(path = %path.display(), error = %e, "Config has out-of-range values");
    }
    info!(path = %path.display(), "Loaded config");
    Ok(config)
}

/// Load from [`default_config_path`], writing the default file first if
/// there is none yet.
pub fn load_default() -> Result<TandemConfig, ConfigError> {
    let path = default_config_path()?;
    match load_from_path(&path) {
        Err(ConfigError::FileNotFound(_)) => {
            create_default_config(&path)?;
            Ok(TandemConfig::default())
        }
        loaded => loaded,
    }
}
