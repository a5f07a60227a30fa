//! Execution backends.
//!
//! A backend accepts a job, runs it somewhere, and reports what happens to it
//! as [`ExecutionEvent`](crate::core::ExecutionEvent)s on an
//! [`EventPublisher`](crate::events::EventPublisher). `submit` only
//! acknowledges acceptance; completion always arrives as an event.

#[cfg(feature = "cluster")]
pub mod cluster;
#[cfg(feature = "container")]
pub mod container;
mod registry;

pub use registry::BackendRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::{CancelError, SubmitError};
use crate::graph::JobExecutionSpec;

/// Opaque reference a backend returns for a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionHandle(String);

impl ExecutionHandle {
    /// Wraps a backend-specific reference.
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Returns the raw reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a backend needs to start one attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSubmission {
    /// Run the job belongs to.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// Job id.
    pub job_id: String,
    /// Stage name.
    pub stage: String,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Execution details.
    pub spec: JobExecutionSpec,
}

/// A place jobs run.
///
/// Implementations must report every accepted attempt's outcome exactly
/// once or more, tagging each event with the submission's attempt.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Registered name of the backend.
    fn name(&self) -> &str;

    /// Submits one attempt.
    ///
    /// # Errors
    ///
    /// Returns a [`SubmitError`] if the backend does not accept the job.
    async fn submit(&self, job: &JobSubmission) -> Result<ExecutionHandle, SubmitError>;

    /// Requests best-effort cancellation of a running attempt.
    ///
    /// # Errors
    ///
    /// Returns a [`CancelError`] if the request could not be delivered.
    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), CancelError>;

    /// Cleans up a submission whose `submit` call was abandoned.
    ///
    /// The attempt may or may not have been started, and no handle was
    /// returned for it. The default does nothing.
    ///
    /// # Errors
    ///
    /// Returns a [`CancelError`] if the cleanup could not be delivered.
    async fn abandon(&self, job: &JobSubmission) -> Result<(), CancelError> {
        let _ = job;
        Ok(())
    }
}
