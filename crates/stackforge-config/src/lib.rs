//! Configuration discovery and loading for Stackforge
//!
//! Configuration documents may be JSON, YAML or TOML; see [`load_config`].

pub mod error;
pub mod loader;

pub use error::*;
pub use loader::{Format, load_config, parse_value, resolve_path};

use std::path::{Path, PathBuf};

/// Environment variable naming a configuration file directly
pub const CONFIG_ENV: &str = "STACKFORGE_CONFIG";

const STEMS: [&str; 3] = ["stackforge.local", "stackforge", "config"];
const EXTENSIONS: [&str; 4] = ["json", "yaml", "yml", "toml"];

/// Stackforge configuration directory, created when missing
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("stackforge");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    STEMS
        .iter()
        .flat_map(|stem| EXTENSIONS.iter().map(move |ext| format!("{}.{}", stem, ext)))
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Locate the configuration file.
///
/// Search order:
/// 1. `STACKFORGE_CONFIG` (if the path exists)
/// 2. current directory: `stackforge.local.*`, `stackforge.*`, `config.*`
/// 3. `./.stackforge/` with the same candidates
/// 4. `~/.config/stackforge/config.json`
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!("{} points to missing file {}", CONFIG_ENV, path.display());
    }

    let current_dir = std::env::current_dir()?;
    if let Some(path) = find_in(&current_dir) {
        return Ok(path);
    }

    let project_dir = current_dir.join(".stackforge");
    if project_dir.is_dir() {
        if let Some(path) = find_in(&project_dir) {
            return Ok(path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("stackforge").join("config.json");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}
