//! aws CLI wrapper
//!
//! Looks up resources that were provisioned outside the current run so the
//! shared resource caches can import them instead of declaring new ones.

use crate::error::{AwsError, Result};
use async_trait::async_trait;
use stackforge_core::{ExistenceProbe, ResourceKind};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Default limit for a single CLI call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// stderr fragments the CLI prints when a looked-up resource is absent
const NOT_FOUND_MARKERS: &[&str] = &[
    "NotFound",
    "NoSuchEntity",
    "ParameterNotFound",
    "InvalidPlacementGroup.Unknown",
    "does not exist",
];

/// Whether a failed call means "absent" rather than a real error
pub fn is_not_found(stderr: &str) -> bool {
    NOT_FOUND_MARKERS.iter().any(|marker| stderr.contains(marker))
}

/// CLI arguments that describe one resource
pub fn lookup_args(kind: ResourceKind, name: &str) -> Vec<String> {
    let args: [&str; 4] = match kind {
        ResourceKind::KeyPair => ["ec2", "describe-key-pairs", "--key-names", name],
        ResourceKind::PlacementGroup => {
            ["ec2", "describe-placement-groups", "--group-names", name]
        }
        ResourceKind::InstanceProfile => [
            "iam",
            "get-instance-profile",
            "--instance-profile-name",
            name,
        ],
        ResourceKind::Parameter => ["ssm", "get-parameter", "--name", name],
    };
    args.iter().map(|arg| arg.to_string()).collect()
}

/// aws CLI wrapper
#[derive(Debug, Clone)]
pub struct AwsCli {
    region: String,
    timeout: Duration,
}

impl AwsCli {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Check that the CLI is installed
    pub async fn check_installed(&self) -> Result<()> {
        let which = Command::new("which").arg("aws").output().await?;
        if !which.status.success() {
            return Err(AwsError::CliNotFound);
        }
        Ok(())
    }

    /// Run an aws command and return stdout, or `None` when the resource is absent
    async fn run_command(&self, args: &[String]) -> Result<Option<String>> {
        let mut cmd = Command::new("aws");
        cmd.arg("--region").arg(&self.region);
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let command = args.join(" ");
        tracing::debug!("Running: aws --region {} {}", self.region, command);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(output) => output.map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AwsError::CliNotFound,
                _ => AwsError::IoError(e),
            })?,
            Err(_) => {
                return Err(AwsError::Timeout {
                    command,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_found(&stderr) {
                return Ok(None);
            }
            return Err(AwsError::CommandFailed(stderr.trim().to_string()));
        }

        Ok(Some(String::from_utf8_lossy(&output.stdout).to_string()))
    }

    pub async fn resource_exists(&self, kind: ResourceKind, name: &str) -> Result<bool> {
        let found = self.run_command(&lookup_args(kind, name)).await?.is_some();
        tracing::debug!("{} {}: {}", kind, name, if found { "found" } else { "absent" });
        Ok(found)
    }

    /// Decrypted value of an SSM parameter
    pub async fn get_parameter(&self, name: &str) -> Result<Option<String>> {
        let mut args = lookup_args(ResourceKind::Parameter, name);
        args.extend(
            ["--with-decryption", "--query", "Parameter.Value", "--output", "text"]
                .iter()
                .map(|arg| arg.to_string()),
        );

        Ok(self
            .run_command(&args)
            .await?
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }
}

/// [`ExistenceProbe`] backed by the aws CLI
#[derive(Debug, Clone)]
pub struct AwsCliProbe {
    cli: AwsCli,
}

impl AwsCliProbe {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            cli: AwsCli::new(region),
        }
    }

    pub fn with_cli(cli: AwsCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl ExistenceProbe for AwsCliProbe {
    async fn exists(&self, kind: ResourceKind, name: &str) -> stackforge_core::Result<bool> {
        Ok(self.cli.resource_exists(kind, name).await?)
    }

    async fn fetch_secret(&self, parameter: &str) -> stackforge_core::Result<Option<String>> {
        Ok(self.cli.get_parameter(parameter).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_markers() {
        assert!(is_not_found(
            "An error occurred (InvalidKeyPair.NotFound) when calling the DescribeKeyPairs operation"
        ));
        assert!(is_not_found("An error occurred (NoSuchEntity) when calling the GetInstanceProfile operation"));
        assert!(is_not_found("An error occurred (ParameterNotFound) when calling the GetParameter operation"));
        assert!(!is_not_found("An error occurred (AccessDenied) when calling the GetParameter operation"));
    }

    #[test]
    fn test_lookup_args() {
        assert_eq!(
            lookup_args(ResourceKind::PlacementGroup, "demo-cluster"),
            vec!["ec2", "describe-placement-groups", "--group-names", "demo-cluster"]
        );
        assert_eq!(
            lookup_args(ResourceKind::InstanceProfile, "p")[1],
            "get-instance-profile"
        );
    }

    #[test]
    fn test_cli_settings() {
        let cli = AwsCli::new("eu-west-1").with_timeout(Duration::from_secs(5));
        assert_eq!(cli.region(), "eu-west-1");
        assert_eq!(cli.timeout, Duration::from_secs(5));
    }
}
