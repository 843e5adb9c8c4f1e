//! Application configuration management utilities.

use camino::Utf8PathBuf;
use directories_next::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

use crate::errors::CliError;

/// Application-wide configuration stored in config.toml.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AppConfig {
    pub library_path: Option<String>,
}

/// Returns the directory where the current executable resides.
pub fn install_dir() -> Option<Utf8PathBuf> {
    let exe = env::current_exe().ok()?;
    let parent = exe.parent()?;
    Utf8PathBuf::from_path_buf(parent.to_path_buf()).ok()
}

/// Returns the default configuration file path (config.toml next to the executable).
pub fn default_config_path() -> Option<Utf8PathBuf> {
    install_dir().map(|dir| dir.join("config.toml"))
}

/// Loads the application configuration from config.toml.
/// Returns default configuration if file doesn't exist or cannot be parsed.
pub fn load_config() -> AppConfig {
    let Some(path) = default_config_path() else {
        return AppConfig::default();
    };
    match fs::read_to_string(path.as_std_path()) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Ignoring malformed {}: {}", path, e);
            AppConfig::default()
        }),
        Err(_) => AppConfig::default(),
    }
}

/// Platform data directory, e.g. `~/.local/share/patchkit` on Linux.
pub fn default_library_dir() -> Option<Utf8PathBuf> {
    let dirs = ProjectDirs::from("", "", "patchkit")?;
    Utf8PathBuf::from_path_buf(dirs.data_dir().to_path_buf()).ok()
}

/// Library directory: `--library`, then config.toml, then the platform data directory.
pub fn resolve_library_dir(cli_override: Option<&str>) -> miette::Result<Utf8PathBuf> {
    if let Some(dir) = cli_override {
        return super::absolute_path(dir);
    }
    if let Some(dir) = load_config().library_path {
        return super::absolute_path(&dir);
    }
    default_library_dir().ok_or_else(|| CliError::NoLibraryLocation.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        assert_eq!(resolve_library_dir(Some(path)).unwrap().as_str(), path);
    }

    #[test]
    fn test_config_roundtrip() {
        let cfg = AppConfig {
            library_path: Some("/data/patches".to_string()),
        };
        let parsed: AppConfig = toml::from_str(&toml::to_string_pretty(&cfg).unwrap()).unwrap();
        assert_eq!(parsed.library_path.as_deref(), Some("/data/patches"));
        assert!(toml::from_str::<AppConfig>("").unwrap().library_path.is_none());
    }
}
