//! Configuration file and state directory discovery

use crate::error::{ConfigError, Result};
use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file directly.
pub const CONFIG_PATH_ENV: &str = "GRIDFLOW_CONFIG_PATH";

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "GRIDFLOW_STATE_DIR";

/// Project-local directory holding configuration and cluster state.
pub const PROJECT_DIR: &str = ".gridflow";

const CANDIDATES: [&str; 4] = [
    "gridflow.local.yml",
    ".gridflow.local.yml",
    "gridflow.yml",
    ".gridflow.yml",
];

/// Returns `~/.config/gridflow`, creating it if needed.
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("gridflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Finds the configuration file.
///
/// Search order:
/// 1. `GRIDFLOW_CONFIG_PATH`
/// 2. the current directory: gridflow.local.yml, .gridflow.local.yml,
///    gridflow.yml, .gridflow.yml
/// 3. the same names inside `./.gridflow/`
/// 4. `~/.config/gridflow/gridflow.yml`
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(path = %path.display(), "{} points to a missing file", CONFIG_PATH_ENV);
    }

    let current_dir = std::env::current_dir()?;
    if let Some(path) = first_existing(&current_dir) {
        return Ok(path);
    }

    let project_dir = current_dir.join(PROJECT_DIR);
    if project_dir.is_dir() {
        if let Some(path) = first_existing(&project_dir) {
            return Ok(path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join("gridflow").join("gridflow.yml");
        if global.exists() {
            return Ok(global);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// Directory holding cluster records: `GRIDFLOW_STATE_DIR`, or `.gridflow/`
/// under the current directory.
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    Ok(std::env::current_dir()?.join(PROJECT_DIR))
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
