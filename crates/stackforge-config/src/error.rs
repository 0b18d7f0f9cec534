use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration directory not found")]
    ConfigDirNotFound,

    #[error(
        "configuration file not found. Looked in:\n\
        - current directory: stackforge.local.{{json,yaml,yml,toml}}, stackforge.{{json,yaml,yml,toml}}, config.{{json,yaml,yml,toml}}\n\
        - ./.stackforge/ directory\n\
        - ~/.config/stackforge/config.json\n\
        or set STACKFORGE_CONFIG to a file path"
    )]
    ConfigFileNotFound,

    #[error("no configuration at {0} (also tried .json, .toml, .yaml, .yml)")]
    NotFound(PathBuf),

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
