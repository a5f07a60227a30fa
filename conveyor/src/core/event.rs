//! Execution events reported by backends.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use super::FailureKind;
use crate::utils::{now_utc, Timestamp};

/// Job state observed by an execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    /// The job started executing.
    Running,
    /// The job exited successfully.
    Succeeded,
    /// The job exited with an error.
    Failed,
    /// The backend canceled or lost the job.
    Canceled,
}

impl fmt::Display for ReportedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// A backend-observed state change for one job of one run.
///
/// Delivery is at-least-once. The idempotency key identifies re-delivered
/// copies; when a producer does not set one it is derived from the event's
/// identifying fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Run the job belongs to.
    pub run_id: Uuid,
    /// Job the event is about.
    pub job_id: String,
    /// Reported state.
    pub status: ReportedStatus,
    /// Exit code, for terminal events.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Error detail, for failures.
    #[serde(default)]
    pub error: Option<String>,
    /// Failure category; defaults to an execution failure.
    #[serde(default)]
    pub kind: Option<FailureKind>,
    /// Attempt the event refers to.
    #[serde(default)]
    pub attempt: Option<u32>,
    /// Per-attempt sequence number assigned by the producer.
    #[serde(default)]
    pub sequence: Option<u64>,
    /// Producer-assigned idempotency key.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// When the backend observed the change.
    pub observed_at: Timestamp,
}

impl ExecutionEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(run_id: Uuid, job_id: impl Into<String>, status: ReportedStatus) -> Self {
        Self {
            run_id,
            job_id: job_id.into(),
            status,
            exit_code: None,
            error: None,
            kind: None,
            attempt: None,
            sequence: None,
            idempotency_key: None,
            observed_at: now_utc(),
        }
    }

    /// A job-started event.
    #[must_use]
    pub fn running(run_id: Uuid, job_id: impl Into<String>) -> Self {
        Self::new(run_id, job_id, ReportedStatus::Running)
    }

    /// A successful exit.
    #[must_use]
    pub fn succeeded(run_id: Uuid, job_id: impl Into<String>) -> Self {
        Self::new(run_id, job_id, ReportedStatus::Succeeded).with_exit_code(0)
    }

    /// A failed exit.
    #[must_use]
    pub fn failed(run_id: Uuid, job_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(run_id, job_id, ReportedStatus::Failed).with_error(error)
    }

    /// A backend-side cancellation.
    #[must_use]
    pub fn canceled(run_id: Uuid, job_id: impl Into<String>) -> Self {
        Self::new(run_id, job_id, ReportedStatus::Canceled)
    }

    /// Sets the exit code.
    #[must_use]
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    /// Sets the error detail.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sets the failure kind.
    #[must_use]
    pub fn with_kind(mut self, kind: FailureKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Sets the attempt number.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Sets the sequence number.
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Sets an explicit idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Returns true for events that end an attempt.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, ReportedStatus::Running)
    }

    /// Returns the producer key, or one derived from the identifying fields.
    ///
    /// An event without an attempt number is keyed to `current_attempt`, the
    /// attempt it applies to.
    #[must_use]
    pub fn idempotency_key(&self, current_attempt: u32) -> String {
        if let Some(ref key) = self.idempotency_key {
            return key.clone();
        }
        let run_id = self.run_id.to_string();
        let attempt = self.attempt.unwrap_or(current_attempt).to_string();
        let sequence = self.sequence.map_or_else(|| "-".to_string(), |s| s.to_string());
        let status = self.status.to_string();
        generate_idempotency_key(&[&run_id, &self.job_id, &attempt, &status, &sequence])
    }
}

/// Generates an idempotency key from components.
#[must_use]
pub fn generate_idempotency_key(components: &[&str]) -> String {
    let combined = components.join(":");
    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    let result = hasher.finalize();
    format!("idem:{}", hex::encode(&result[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_idempotency_key() {
        let key1 = generate_idempotency_key(&["run", "compile", "1"]);
        let key2 = generate_idempotency_key(&["run", "compile", "1"]);
        let key3 = generate_idempotency_key(&["run", "compile", "2"]);

        assert!(key1.starts_with("idem:"));
        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_derived_key_stable_across_copies() {
        let run_id = Uuid::now_v7();
        let event = ExecutionEvent::succeeded(run_id, "compile").with_attempt(1);
        let redelivered = event.clone();
        assert_eq!(event.idempotency_key(1), redelivered.idempotency_key(1));
    }

    #[test]
    fn test_derived_key_differs_per_attempt() {
        let run_id = Uuid::now_v7();
        let first = ExecutionEvent::failed(run_id, "compile", "boom").with_attempt(1);
        let second = ExecutionEvent::failed(run_id, "compile", "boom").with_attempt(2);
        assert_ne!(first.idempotency_key(2), second.idempotency_key(2));
    }

    #[test]
    fn test_attemptless_key_follows_current_attempt() {
        let event = ExecutionEvent::failed(Uuid::nil(), "compile", "boom");
        assert_ne!(event.idempotency_key(1), event.idempotency_key(2));
        assert_eq!(event.idempotency_key(2), event.clone().with_attempt(2).idempotency_key(7));
    }

    #[test]
    fn test_explicit_key_wins() {
        let event = ExecutionEvent::running(Uuid::nil(), "lint").with_idempotency_key("msg-42");
        assert_eq!(event.idempotency_key(1), "msg-42");
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_event_deserializes_with_defaults() {
        let json = serde_json::json!({
            "run_id": Uuid::nil(),
            "job_id": "lint",
            "status": "failed",
            "observed_at": "2026-01-01T00:00:00Z",
        });
        let event: ExecutionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.status, ReportedStatus::Failed);
        assert!(event.attempt.is_none());
        assert!(event.is_terminal());
    }
}
