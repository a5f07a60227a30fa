//! Local container backend driving the `docker` or `podman` CLI.
//!
//! Each attempt runs as a detached container named after the run, job and
//! attempt. A watcher task blocks on `<runtime> wait` and publishes the exit
//! status once the container stops.

use async_trait::async_trait;
use dashmap::DashSet;
use regex::Regex;
use std::process::Output;
use std::sync::{Arc, OnceLock};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{ExecutionBackend, ExecutionHandle, JobSubmission};
use crate::core::{ExecutionEvent, FailureKind};
use crate::errors::{CancelError, SubmitError};
use crate::events::EventPublisher;
use crate::utils::short_id;

#[allow(clippy::expect_used)]
fn unsafe_name_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.-]").expect("name pattern compiles"))
}

/// Runs jobs as containers on the local host.
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    name: String,
    runtime: String,
    publisher: EventPublisher,
    canceled: Arc<DashSet<String>>,
}

impl ContainerBackend {
    /// Creates a backend invoking `runtime` (a docker-compatible CLI).
    #[must_use]
    pub fn new(name: impl Into<String>, runtime: impl Into<String>, publisher: EventPublisher) -> Self {
        Self {
            name: name.into(),
            runtime: runtime.into(),
            publisher,
            canceled: Arc::new(DashSet::new()),
        }
    }

    /// A backend named `docker` using the docker CLI.
    #[must_use]
    pub fn docker(publisher: EventPublisher) -> Self {
        Self::new("docker", "docker", publisher)
    }

    /// A backend named `podman` using the podman CLI.
    #[must_use]
    pub fn podman(publisher: EventPublisher) -> Self {
        Self::new("podman", "podman", publisher)
    }

    /// Container name for one attempt.
    #[must_use]
    pub fn container_name(job: &JobSubmission) -> String {
        let raw = format!("conveyor-{}-{}-{}", short_id(&job.run_id), job.job_id, job.attempt);
        unsafe_name_chars().replace_all(&raw, "-").into_owned()
    }

    /// Arguments to `<runtime>` that start the attempt detached.
    #[must_use]
    pub fn run_args(job: &JobSubmission, container: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            container.to_string(),
            "--label".to_string(),
            format!("conveyor.run={}", job.run_id),
            "--label".to_string(),
            format!("conveyor.job={}", job.job_id),
            "--label".to_string(),
            format!("conveyor.attempt={}", job.attempt),
        ];

        if let Some(millis) = job.spec.resources.cpu_millis {
            args.push("--cpus".to_string());
            args.push(format!("{}.{:03}", millis / 1000, millis % 1000));
        }
        if let Some(mb) = job.spec.resources.memory_mb {
            args.push("--memory".to_string());
            args.push(format!("{mb}m"));
        }
        for (key, value) in &job.spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        args.push(job.spec.image.clone());
        args.extend(job.spec.command.iter().cloned());
        args
    }

    async fn exec(&self, args: &[String]) -> std::io::Result<Output> {
        Command::new(&self.runtime)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
    }

    fn spawn_watcher(&self, job: &JobSubmission, container: String) {
        let backend = self.clone();
        let run_id = job.run_id;
        let job_id = job.job_id.clone();
        let attempt = job.attempt;

        tokio::spawn(async move {
            let event = match backend.exec(&["wait".to_string(), container.clone()]).await {
                Ok(output) if output.status.success() => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    match stdout.trim().parse::<i32>() {
                        Ok(0) => ExecutionEvent::succeeded(run_id, &job_id),
                        Ok(code) => ExecutionEvent::failed(run_id, &job_id, format!("container exited with {code}"))
                            .with_exit_code(code),
                        Err(_) => ExecutionEvent::failed(
                            run_id,
                            &job_id,
                            format!("unexpected wait output: {}", stdout.trim()),
                        ),
                    }
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    ExecutionEvent::failed(run_id, &job_id, format!("wait failed: {}", stderr.trim()))
                }
                Err(err) => ExecutionEvent::failed(run_id, &job_id, format!("wait failed: {err}")),
            };

            let event = if backend.canceled.remove(&container).is_some() {
                ExecutionEvent::canceled(run_id, &job_id).with_kind(FailureKind::Canceled)
            } else {
                event
            };

            debug!(container = %container, status = %event.status, "container finished");
            backend
                .publisher
                .publish(event.with_attempt(attempt).with_sequence(2))
                .await;

            if let Err(err) = backend.exec(&["rm".to_string(), "-f".to_string(), container.clone()]).await {
                warn!(container = %container, error = %err, "failed to remove finished container");
            }
        });
    }
}

/// Maps CLI stderr from a failed `run` to a submit error.
#[must_use]
pub fn classify_submit_failure(image: &str, stderr: &str) -> SubmitError {
    let lower = stderr.to_lowercase();
    let reason = stderr.trim().to_string();

    if lower.contains("pull access denied")
        || lower.contains("manifest unknown")
        || lower.contains("manifest for")
        || (lower.contains("pull") && lower.contains("not found"))
        || lower.contains("error pulling image")
    {
        SubmitError::ImagePull {
            image: image.to_string(),
            reason,
        }
    } else if lower.contains("quota") || lower.contains("no space left") || lower.contains("cannot allocate memory") {
        SubmitError::QuotaExceeded(reason)
    } else if lower.contains("cannot connect") || lower.contains("is the docker daemon running") {
        SubmitError::Unavailable(reason)
    } else {
        SubmitError::Rejected(reason)
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, job: &JobSubmission) -> Result<ExecutionHandle, SubmitError> {
        let container = Self::container_name(job);
        info!(
            job_id = %job.job_id,
            attempt = job.attempt,
            image = %job.spec.image,
            container = %container,
            "starting container"
        );

        let output = self
            .exec(&Self::run_args(job, &container))
            .await
            .map_err(|e| SubmitError::Unavailable(format!("failed to execute {}: {e}", self.runtime)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(container = %container, stderr = %stderr.trim(), "container start failed");
            return Err(classify_submit_failure(&job.spec.image, &stderr));
        }

        self.publisher
            .publish(
                ExecutionEvent::running(job.run_id, &job.job_id)
                    .with_attempt(job.attempt)
                    .with_sequence(1),
            )
            .await;
        self.spawn_watcher(job, container.clone());

        Ok(ExecutionHandle::new(container))
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), CancelError> {
        let container = handle.as_str().to_string();
        self.canceled.insert(container.clone());

        let output = self
            .exec(&["rm".to_string(), "-f".to_string(), container.clone()])
            .await
            .map_err(|e| CancelError::Unavailable(e.to_string()))?;

        if output.status.success() {
            info!(container = %container, "container removed");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_lowercase().contains("no such container") {
            debug!(container = %container, "container already gone");
            Ok(())
        } else {
            self.canceled.remove(&container);
            Err(CancelError::Failed(stderr.trim().to_string()))
        }
    }

    async fn abandon(&self, job: &JobSubmission) -> Result<(), CancelError> {
        // The daemon may have created the container before `run` was killed.
        let container = Self::container_name(job);
        warn!(container = %container, "removing container of abandoned submission");
        self.cancel(&ExecutionHandle::new(container)).await
    }
}
