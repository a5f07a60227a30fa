//! Recorded causes of job failure.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::{now_utc, Timestamp};

/// Why a job stopped without succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The backend refused the submission.
    Submit,
    /// Non-zero exit or backend-reported error.
    #[default]
    Execution,
    /// The job exceeded its maximum duration.
    Timeout,
    /// The job's submission outcome was lost across a restart.
    Interrupted,
    /// Canceled by request or because a dependency failed.
    Canceled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submit => write!(f, "submit"),
            Self::Execution => write!(f, "execution"),
            Self::Timeout => write!(f, "timeout"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Cause recorded on a job that failed, was retried, or was canceled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
    /// Exit code, if the job ran far enough to produce one.
    pub exit_code: Option<i32>,
    /// Which attempt failed.
    pub attempt: u32,
    /// When the failure was recorded.
    pub recorded_at: Timestamp,
}

impl JobFailure {
    /// Creates a new failure record.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            attempt,
            recorded_at: now_utc(),
        }
    }

    /// Sets the exit code.
    #[must_use]
    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Sets the timestamp.
    #[must_use]
    pub fn at(mut self, recorded_at: Timestamp) -> Self {
        self.recorded_at = recorded_at;
        self
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} (exit {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}
