//! AWS CLI error types

use stackforge_core::ForgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AwsError {
    #[error("aws CLI not found. Please install: https://aws.amazon.com/cli/")]
    CliNotFound,

    #[error("aws command failed: {0}")]
    CommandFailed(String),

    #[error("aws command timed out after {secs}s: {command}")]
    Timeout { command: String, secs: u64 },

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<AwsError> for ForgeError {
    fn from(e: AwsError) -> Self {
        ForgeError::Probe(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AwsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_to_probe_error() {
        let e: ForgeError = AwsError::CommandFailed("AccessDenied".into()).into();
        assert!(matches!(e, ForgeError::Probe(message) if message.contains("AccessDenied")));
    }
}
