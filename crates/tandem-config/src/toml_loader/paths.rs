//! Where the config file lives, and writing the default one.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tandem_common::ConfigError;
use tracing::info;

use super::template::default_config_toml;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV_VAR: &str = "TANDEM_CONFIG";

/// `$TANDEM_CONFIG` if set, else `<config_dir>/tandem/config.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    resolve(std::env::var_os(CONFIG_ENV_VAR), dirs::config_dir())
}

fn resolve(overridden: Option<OsString>, config_dir: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = overridden.filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    config_dir
        .map(|dir| dir.join("tandem").join("config.toml"))
        .ok_or_else(|| ConfigError::ParseError("could not determine config directory".into()))
}

/// Write the commented default config to `path`, creating parent dirs.
pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_error("create", parent, e))?;
    }
    std::fs::write(path, default_config_toml()).map_err(|e| io_error("write", path, e))?;
    info!(path = %path.display(), "Created default config");
    Ok(())
}

pub(super) fn io_error(action: &str, path: &Path, e: std::io::Error) -> ConfigError {
    ConfigError::ParseError(format!("failed to {action} {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins() {
        let path = resolve(Some("/etc/tandem.toml".into()), Some("/home/u/.config".into())).unwrap();
        assert_eq!(path, PathBuf::from("/etc/tandem.toml"));
    }

    #[test]
    fn empty_override_is_ignored() {
        let path = resolve(Some(OsString::new()), Some("/home/u/.config".into())).unwrap();
        assert_eq!(path, PathBuf::from("/home/u/.config/tandem/config.toml"));
    }

    #[test]
    fn no_config_dir_is_an_error() {
        assert!(matches!(resolve(None, None), Err(ConfigError::ParseError(_))));
    }
}
