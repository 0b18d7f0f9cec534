//! Forge orchestration error types

use thiserror::Error;

/// Orchestration errors
#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("unknown forge type: {0}")]
    UnknownForgeType(String),

    #[error("forge instance {0} not found")]
    InstanceNotFound(String),

    #[error("invalid configuration for '{id}': {message}")]
    InvalidConfig { id: String, message: String },

    #[error("invalid format: invalid dependency format '{0}'")]
    InvalidDependencyFormat(String),

    #[error("resource not found: resource '{0}' not found")]
    ResourceNotFound(String),

    #[error("{0} dependency not found")]
    DependencyTypeNotFound(String),

    #[error("property '{property}' not found on dependency '{token}'")]
    PropertyNotFound { token: String, property: String },

    #[error("unexpected configuration variant: expected {expected}, found {found}")]
    UnexpectedConfig {
        expected: &'static str,
        found: &'static str,
    },

    #[error("network foundation has not been created")]
    MissingNetwork,

    #[error("forge '{0}' used before create")]
    NotCreated(String),

    #[error("logical id already declared in stack: {0}")]
    DuplicateLogicalId(String),

    #[error("existence probe failed: {0}")]
    Probe(String),

    #[error("failed to process '{id}': {source}")]
    Processing {
        id: String,
        #[source]
        source: Box<ForgeError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ForgeError {
    /// Prefix an error with the enabled id being processed
    pub fn processing(id: impl Into<String>, source: ForgeError) -> Self {
        ForgeError::Processing {
            id: id.into(),
            source: Box::new(source),
        }
    }

    pub fn invalid_config(id: impl Into<String>, message: impl Into<String>) -> Self {
        ForgeError::InvalidConfig {
            id: id.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;
