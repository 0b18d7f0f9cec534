//! Multi-format configuration loading
//!
//! YAML and TOML documents are converted to JSON values before they are
//! decoded, so every format sees the same camelCase keys.

use crate::error::{ConfigError, Result};
use serde_json::Value;
use stackforge_core::Config;
use std::path::{Path, PathBuf};

/// Extensions tried when the given path does not exist
pub const FALLBACK_EXTENSIONS: [&str; 4] = ["json", "toml", "yaml", "yml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
    Toml,
}

impl Format {
    /// Format for a file extension; unknown extensions are read as JSON
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("yaml") | Some("yml") => Format::Yaml,
            Some("toml") => Format::Toml,
            _ => Format::Json,
        }
    }
}

/// The path itself if it exists, otherwise the first sibling with a known extension
pub fn resolve_path(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    for ext in FALLBACK_EXTENSIONS {
        let candidate = path.with_extension(ext);
        if candidate.is_file() {
            tracing::debug!("Using {} for {}", candidate.display(), path.display());
            return Ok(candidate);
        }
    }
    Err(ConfigError::NotFound(path.to_path_buf()))
}

/// Parse a document into a JSON value
pub fn parse_value(contents: &str, format: Format) -> std::result::Result<Value, String> {
    match format {
        Format::Json => serde_json::from_str(contents).map_err(|e| e.to_string()),
        Format::Yaml => serde_yaml::from_str(contents).map_err(|e| e.to_string()),
        Format::Toml => toml::from_str(contents).map_err(|e| e.to_string()),
    }
}

/// Load and decode the configuration at `path`
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = resolve_path(path.as_ref())?;
    let contents = std::fs::read_to_string(&path)?;
    let format = Format::from_path(&path);

    let parse_error = |message: String| ConfigError::Parse {
        path: path.clone(),
        message,
    };
    let value = parse_value(&contents, format).map_err(parse_error)?;
    let config: Config =
        serde_json::from_value(value).map_err(|e| parse_error(e.to_string()))?;

    tracing::info!(
        "Loaded configuration from {} ({} enabled ids)",
        path.display(),
        config.enabled_forges.len()
    );
    Ok(config)
}
