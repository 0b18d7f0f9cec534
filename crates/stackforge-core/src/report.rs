//! Outcome of one orchestration run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Outcome of one enabled id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdOutcome {
    /// Enabled id as listed in the configuration
    pub id: String,

    /// Forge type, when it was resolved
    pub kind: Option<String>,

    /// Dependency key on success, error message on failure
    pub message: String,
}

/// Result of processing every enabled id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub stack_name: String,

    /// Dependency key of the network foundation
    pub network: Option<String>,

    pub succeeded: Vec<IdOutcome>,

    pub failed: Vec<IdOutcome>,

    /// Ids handled by the network foundation instead of the per-id loop
    pub skipped: Vec<String>,

    pub started_at: DateTime<Utc>,

    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl RunReport {
    pub fn new(stack_name: impl Into<String>) -> Self {
        Self {
            stack_name: stack_name.into(),
            network: None,
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn add_success(&mut self, id: impl Into<String>, kind: impl Into<String>, key: impl Into<String>) {
        self.succeeded.push(IdOutcome {
            id: id.into(),
            kind: Some(kind.into()),
            message: key.into(),
        });
    }

    pub fn add_failure(&mut self, id: impl Into<String>, kind: Option<String>, error: impl Into<String>) {
        self.failed.push(IdOutcome {
            id: id.into(),
            kind,
            message: error.into(),
        });
    }

    pub fn finish(&mut self, started: Instant) {
        self.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped in {}ms",
            self.succeeded.len(),
            self.failed.len(),
            self.skipped.len(),
            self.duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_success_and_summary() {
        let mut report = RunReport::new("demo");
        report.add_success("data", "efs", "EFS:data");
        report.skipped.push("main".into());
        assert!(report.is_success());

        report.add_failure("web", Some("ec2".into()), "failed to process 'web'");
        assert!(!report.is_success());
        assert_eq!(report.to_string(), "1 succeeded, 1 failed, 1 skipped in 0ms");
    }
}
