//! Build session model
//!
//! A [`BuildSession`] is owned by the orchestrator, advanced once per
//! iteration, and frozen once its status leaves `running`.

use crate::error::{CoordinationError, CoordinationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle status of a build session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Running,
    Succeeded,
    Failed,
    AbortedCostLimit,
    AbortedTimeout,
    AbortedIterationLimit,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::AbortedCostLimit => "aborted_cost_limit",
            Self::AbortedTimeout => "aborted_timeout",
            Self::AbortedIterationLimit => "aborted_iteration_limit",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content-addressed reference to a stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Hex digest of the artifact contents
    pub digest: String,
    /// Where the stored copy lives
    pub path: PathBuf,
}

impl ArtifactRef {
    pub fn new(digest: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            digest: digest.into(),
            path: path.into(),
        }
    }

    /// First 12 digest characters, for logs
    pub fn short_digest(&self) -> &str {
        let end = self.digest.len().min(12);
        &self.digest[..end]
    }
}

/// One autonomous build attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSession {
    pub id: Uuid,
    /// Branch the final artifact is pushed to
    pub branch: String,
    /// Iterations started so far
    pub iteration: u32,
    /// Accumulated cost in USD
    pub cost: f64,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BuildSession {
    /// New running session; the branch defaults to `strategy/<short id>`
    pub fn new(branch: Option<String>) -> Self {
        let id = Uuid::new_v4();
        let branch = branch.unwrap_or_else(|| {
            let simple = id.simple().to_string();
            format!("strategy/{}", &simple[..8])
        });
        let now = Utc::now();
        Self {
            id,
            branch,
            iteration: 0,
            cost: 0.0,
            status: BuildStatus::Running,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == BuildStatus::Running
    }

    /// Begin the next iteration and return its number (1-indexed)
    pub fn begin_iteration(&mut self) -> CoordinationResult<u32> {
        self.ensure_running("running")?;
        self.iteration += 1;
        self.updated_at = Utc::now();
        Ok(self.iteration)
    }

    /// Mirror the escalation state's accumulated cost
    pub fn set_cost(&mut self, cost: f64) {
        self.cost = cost;
        self.updated_at = Utc::now();
    }

    /// Move to a terminal status
    pub fn finish(&mut self, status: BuildStatus) -> CoordinationResult<()> {
        if !status.is_terminal() {
            return Err(CoordinationError::InvalidStateTransition {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.ensure_running(status.as_str())?;
        self.status = status;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn ensure_running(&self, to: &str) -> CoordinationResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(CoordinationError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_defaults() {
        let session = BuildSession::new(None);
        assert!(session.is_running());
        assert_eq!(session.iteration, 0);
        assert!(session.branch.starts_with("strategy/"));
        assert_eq!(session.branch.len(), "strategy/".len() + 8);
    }

    #[test]
    fn test_iterations_advance() {
        let mut session = BuildSession::new(Some("feature/momentum".into()));
        assert_eq!(session.begin_iteration().unwrap(), 1);
        assert_eq!(session.begin_iteration().unwrap(), 2);
        assert_eq!(session.branch, "feature/momentum");
    }

    #[test]
    fn test_terminal_is_final() {
        let mut session = BuildSession::new(None);
        session.finish(BuildStatus::AbortedCostLimit).unwrap();
        assert!(session.finish(BuildStatus::Succeeded).is_err());
        assert!(session.begin_iteration().is_err());
        assert_eq!(session.status, BuildStatus::AbortedCostLimit);
    }

    #[test]
    fn test_cannot_finish_as_running() {
        let mut session = BuildSession::new(None);
        let err = session.finish(BuildStatus::Running).unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&BuildStatus::AbortedIterationLimit).unwrap();
        assert_eq!(json, "\"aborted_iteration_limit\"");
        assert_eq!(BuildStatus::AbortedTimeout.to_string(), "aborted_timeout");
    }
}
