//! Run and job status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a pipeline run or of one of its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not started.
    #[default]
    Pending,
    /// At least one job has started.
    Running,
    /// Every job succeeded.
    Succeeded,
    /// At least one job failed.
    Failed,
    /// Canceled by request or by upstream failure.
    Canceled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl RunStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// Status of a single job execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting on dependencies.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a concurrency slot.
    Ready,
    /// Claimed and handed to a backend.
    Dispatched,
    /// The backend reported the job running.
    Running,
    /// Finished with success.
    Succeeded,
    /// Finished with failure and no retries left.
    Failed,
    /// Canceled before or during execution.
    Canceled,
    /// Failed, waiting out the backoff before running again.
    Retrying,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

impl JobStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Returns true while the job holds a concurrency slot.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }

    /// Returns true if dependents of a job in this state can never run.
    #[must_use]
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }

    /// Returns true if the job has not been handed to a backend yet.
    #[must_use]
    pub fn is_unstarted(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_display() {
        assert_eq!(JobStatus::Dispatched.to_string(), "dispatched");
        assert_eq!(JobStatus::Retrying.to_string(), "retrying");
        assert_eq!(RunStatus::Canceled.to_string(), "canceled");
    }

    #[test]
    fn test_job_status_is_terminal() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_job_status_in_flight() {
        assert!(JobStatus::Dispatched.is_in_flight());
        assert!(JobStatus::Running.is_in_flight());
        assert!(!JobStatus::Ready.is_in_flight());
        assert!(!JobStatus::Retrying.is_in_flight());
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&JobStatus::Retrying).unwrap();
        assert_eq!(json, r#""retrying""#);

        let status: RunStatus = serde_json::from_str(r#""succeeded""#).unwrap();
        assert_eq!(status, RunStatus::Succeeded);
    }
}
