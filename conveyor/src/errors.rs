//! Error types for the conveyor engine.
//!
//! Only configuration errors on run start and storage-layer failures ever
//! reach a caller. Everything that goes wrong with an individual job is
//! turned into a job state transition by the scheduler instead.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// The main error type for conveyor operations.
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// The pipeline graph is invalid; the run never starts.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// The run state store is unavailable or rejected an update.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Settings could not be loaded.
    #[error("{0}")]
    Settings(#[from] SettingsError),

    /// A run id that neither this engine nor the store knows about.
    #[error("Unknown run: {0}")]
    UnknownRun(Uuid),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Metadata attached to a configuration error for better diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "GRAPH-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// What kind of graph defect a [`ConfigurationError`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigurationErrorKind {
    /// The dependency graph contains a cycle.
    Cycle,
    /// A job depends on a job that does not exist.
    UnknownDependency,
    /// A job references a stage that does not exist.
    OrphanJob,
    /// Two jobs or two stages share a name.
    Duplicate,
    /// The pipeline has no jobs.
    Empty,
    /// A job's own definition is malformed.
    InvalidJob,
}

/// Error raised when a pipeline graph fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigurationError {
    /// What went wrong.
    pub kind: ConfigurationErrorKind,
    /// The error message.
    pub message: String,
    /// The jobs (or stages) involved in the error.
    pub jobs: Vec<String>,
    /// Diagnostic info.
    pub info: ErrorInfo,
}

impl ConfigurationError {
    fn new(
        kind: ConfigurationErrorKind,
        message: String,
        jobs: Vec<String>,
        info: ErrorInfo,
    ) -> Self {
        Self {
            kind,
            message,
            jobs,
            info,
        }
    }

    /// A dependency cycle; `path` starts and ends with the same job.
    #[must_use]
    pub fn cycle(path: Vec<String>) -> Self {
        let rendered = path.join(" -> ");
        let info = ErrorInfo::new(
            "GRAPH-001-CYCLE",
            format!("Pipeline contains a dependency cycle: {rendered}"),
        )
        .with_fix_hint("Remove one of the `needs` entries in the cycle, or move a job to a later stage.");
        Self::new(
            ConfigurationErrorKind::Cycle,
            format!("Cycle detected in pipeline: {rendered}"),
            path,
            info,
        )
    }

    /// A job needs a job that is not declared.
    #[must_use]
    pub fn unknown_dependency(job: &str, dependency: &str) -> Self {
        let info = ErrorInfo::new(
            "GRAPH-002-UNKNOWN_DEP",
            format!("Dependency '{dependency}' not found"),
        )
        .with_fix_hint("Check the `needs` list for typos in job names.")
        .with_context_entry("job", job);
        Self::new(
            ConfigurationErrorKind::UnknownDependency,
            format!("Job '{job}' depends on unknown job '{dependency}'"),
            vec![job.to_string(), dependency.to_string()],
            info,
        )
    }

    /// A job is assigned to a stage that is not declared.
    #[must_use]
    pub fn orphan_job(job: &str, stage: &str) -> Self {
        let info = ErrorInfo::new(
            "GRAPH-003-ORPHAN_JOB",
            format!("Job '{job}' belongs to no declared stage"),
        )
        .with_fix_hint("Declare the stage in the pipeline's stage list.")
        .with_context_entry("stage", stage);
        Self::new(
            ConfigurationErrorKind::OrphanJob,
            format!("Job '{job}' references unknown stage '{stage}'"),
            vec![job.to_string()],
            info,
        )
    }

    /// Two entities of the same kind share a name.
    #[must_use]
    pub fn duplicate(what: &str, name: &str) -> Self {
        let info = ErrorInfo::new(
            "GRAPH-004-DUPLICATE",
            format!("Duplicate {what} name '{name}'"),
        )
        .with_fix_hint("Rename one of the definitions.");
        Self::new(
            ConfigurationErrorKind::Duplicate,
            format!("Duplicate {what} '{name}' in pipeline"),
            vec![name.to_string()],
            info,
        )
    }

    /// The pipeline has nothing to run.
    #[must_use]
    pub fn empty(pipeline: &str) -> Self {
        let info = ErrorInfo::new("GRAPH-005-EMPTY", "Cannot run an empty pipeline")
            .with_fix_hint("Add at least one job to the pipeline.");
        Self::new(
            ConfigurationErrorKind::Empty,
            format!("Pipeline '{pipeline}' has no jobs"),
            Vec::new(),
            info,
        )
    }

    /// A job definition is malformed.
    #[must_use]
    pub fn invalid_job(job: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let info = ErrorInfo::new("GRAPH-006-INVALID_JOB", reason.clone());
        Self::new(
            ConfigurationErrorKind::InvalidJob,
            format!("Invalid job '{job}': {reason}"),
            vec![job.to_string()],
            info,
        )
    }
}

/// A backend refused to accept a job for execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The job image could not be pulled.
    #[error("Image pull failed for '{image}': {reason}")]
    ImagePull {
        /// The image reference.
        image: String,
        /// Backend-provided reason.
        reason: String,
    },

    /// The backend is out of quota or capacity.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The backend could not be reached.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the job for another reason.
    #[error("Submission rejected: {0}")]
    Rejected(String),

    /// The backend did not acknowledge the submission in time.
    #[error("Submission not acknowledged within {after_ms}ms")]
    Timeout {
        /// The bound that elapsed.
        after_ms: u64,
    },

    /// The job names a backend that is not registered.
    #[error("Unknown execution backend '{0}'")]
    UnknownBackend(String),
}

/// A best-effort cancel could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    /// The backend could not be reached.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend reported an error while canceling.
    #[error("Cancel failed: {0}")]
    Failed(String),
}

/// Errors from the run state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage layer cannot be reached.
    #[error("Run state store unavailable: {0}")]
    Unavailable(String),

    /// A compare-and-set check failed.
    #[error("Conflicting update for run {run_id}: {detail}")]
    Conflict {
        /// The run being updated.
        run_id: Uuid,
        /// Which check failed.
        detail: String,
    },

    /// A delta referenced a run that has no record.
    #[error("Run {0} not found in store")]
    NotFound(Uuid),

    /// A run with this id was already created.
    #[error("Run {0} already exists in store")]
    AlreadyExists(Uuid),

    /// A record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Returns true if this is a compare-and-set conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The settings file is not valid JSON for the settings schema.
    #[error("Invalid settings file: {0}")]
    Parse(String),

    /// A setting has an unusable value.
    #[error("Invalid value for '{key}': {value}")]
    Invalid {
        /// The setting name.
        key: String,
        /// The offending value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_creation() {
        let info = ErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("job", "compile");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("job"), Some(&"compile".to_string()));
    }

    #[test]
    fn test_cycle_error() {
        let err = ConfigurationError::cycle(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);

        assert_eq!(err.kind, ConfigurationErrorKind::Cycle);
        assert!(err.to_string().contains("a -> b -> a"));
        assert_eq!(err.info.code, "GRAPH-001-CYCLE");
    }

    #[test]
    fn test_unknown_dependency_error() {
        let err = ConfigurationError::unknown_dependency("test", "compile");
        assert_eq!(err.jobs, vec!["test".to_string(), "compile".to_string()]);
        assert_eq!(err.info.code, "GRAPH-002-UNKNOWN_DEP");
    }

    #[test]
    fn test_configuration_error_converts() {
        let err: ConveyorError = ConfigurationError::empty("ci").into();
        assert!(matches!(err, ConveyorError::Configuration(_)));
    }

    #[test]
    fn test_store_error_conflict() {
        let err = StoreError::Conflict {
            run_id: Uuid::nil(),
            detail: "version 3 != 4".to_string(),
        };
        assert!(err.is_conflict());
        assert!(!StoreError::Unavailable("down".into()).is_conflict());
    }

    #[test]
    fn test_submit_error_display() {
        let err = SubmitError::ImagePull {
            image: "rust:nope".to_string(),
            reason: "manifest unknown".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Image pull failed for 'rust:nope': manifest unknown"
        );
    }
}
