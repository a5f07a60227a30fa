//! Cluster backend running each attempt as a pod.
//!
//! The backend talks to the cluster through a [`PodClient`], renders one pod
//! manifest per attempt, and polls the pod phase until it terminates.

use async_trait::async_trait;
use dashmap::DashSet;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{ExecutionBackend, ExecutionHandle, JobSubmission};
use crate::core::{ExecutionEvent, FailureKind};
use crate::errors::{CancelError, SubmitError};
use crate::events::EventPublisher;
use crate::utils::short_id;

/// Consecutive poll errors after which an attempt is reported failed.
pub const MAX_POLL_ERRORS: u32 = 5;

/// Observed lifecycle phase of a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodPhase {
    /// Scheduled or pulling its image.
    Pending,
    /// The container is running.
    Running,
    /// The container exited 0.
    Succeeded,
    /// The container exited non-zero or was evicted.
    Failed {
        /// Container exit code, if known.
        exit_code: Option<i32>,
        /// Reason reported by the cluster.
        reason: String,
    },
    /// The pod no longer exists.
    NotFound,
}

/// Errors from the cluster API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PodApiError {
    /// The API server could not be reached.
    #[error("cluster API unavailable: {0}")]
    Unavailable(String),
    /// A resource quota prevented creation.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    /// The manifest was refused.
    #[error("pod rejected: {0}")]
    Rejected(String),
    /// The pod does not exist.
    #[error("pod not found: {0}")]
    NotFound(String),
}

/// Minimal pod API used by [`ClusterBackend`].
#[async_trait]
pub trait PodClient: Send + Sync + 'static {
    /// Creates a pod from a manifest and returns its name.
    async fn create_pod(&self, manifest: &Value) -> Result<String, PodApiError>;

    /// Reads the current phase of a pod.
    async fn pod_phase(&self, name: &str) -> Result<PodPhase, PodApiError>;

    /// Deletes a pod.
    async fn delete_pod(&self, name: &str) -> Result<(), PodApiError>;
}

/// Runs jobs as pods in one namespace.
pub struct ClusterBackend<C: PodClient> {
    name: String,
    namespace: String,
    client: Arc<C>,
    publisher: EventPublisher,
    poll_interval: Duration,
    canceled: Arc<DashSet<String>>,
}

impl<C: PodClient> ClusterBackend<C> {
    /// Creates a backend named `name` targeting `namespace`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        client: Arc<C>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            client,
            publisher,
            poll_interval: Duration::from_secs(2),
            canceled: Arc::new(DashSet::new()),
        }
    }

    /// Sets how often pod phases are polled.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// DNS-safe pod name for one attempt, at most 63 characters.
    #[must_use]
    pub fn pod_name(job: &JobSubmission) -> String {
        let slug: String = job
            .job_id
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let mut name = format!("conveyor-{}-{}-{}", short_id(&job.run_id), slug, job.attempt);
        if name.len() > 63 {
            // Keep the attempt suffix, trim the job slug.
            let suffix = format!("-{}", job.attempt);
            name.truncate(63 - suffix.len());
            name = format!("{}{suffix}", name.trim_end_matches('-'));
        }
        name
    }

    /// Renders the pod manifest for one attempt.
    #[must_use]
    pub fn pod_manifest(job: &JobSubmission, namespace: &str) -> Value {
        let env: Vec<Value> = job
            .spec
            .env
            .iter()
            .map(|(k, v)| json!({"name": k, "value": v}))
            .collect();

        let mut requests = serde_json::Map::new();
        if let Some(cpu) = job.spec.resources.cpu_millis {
            requests.insert("cpu".to_string(), json!(format!("{cpu}m")));
        }
        if let Some(mem) = job.spec.resources.memory_mb {
            requests.insert("memory".to_string(), json!(format!("{mem}Mi")));
        }

        let mut container = json!({
            "name": "job",
            "image": job.spec.image,
            "env": env,
            "resources": {"requests": requests},
        });
        if !job.spec.command.is_empty() {
            container["command"] = json!(job.spec.command);
        }

        let mut manifest = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": Self::pod_name(job),
                "namespace": namespace,
                "labels": {
                    "conveyor.run": job.run_id.to_string(),
                    "conveyor.job": job.job_id,
                    "conveyor.attempt": job.attempt.to_string(),
                },
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [container],
            },
        });
        if let Some(secs) = job.spec.timeout_secs {
            manifest["spec"]["activeDeadlineSeconds"] = json!(secs);
        }
        manifest
    }

    fn spawn_poller(&self, job: &JobSubmission, pod: String) {
        let client = Arc::clone(&self.client);
        let publisher = self.publisher.clone();
        let canceled = Arc::clone(&self.canceled);
        let interval = self.poll_interval;
        let run_id = job.run_id;
        let job_id = job.job_id.clone();
        let attempt = job.attempt;

        tokio::spawn(async move {
            let mut announced_running = false;
            let mut errors = 0u32;

            let terminal = loop {
                tokio::time::sleep(interval).await;

                let phase = match client.pod_phase(&pod).await {
                    Ok(phase) => {
                        errors = 0;
                        phase
                    }
                    Err(PodApiError::NotFound(_)) => PodPhase::NotFound,
                    Err(err) => {
                        errors += 1;
                        warn!(pod = %pod, error = %err, errors, "pod poll failed");
                        if errors >= MAX_POLL_ERRORS {
                            break ExecutionEvent::failed(
                                run_id,
                                &job_id,
                                format!("lost track of pod after {errors} poll errors: {err}"),
                            );
                        }
                        continue;
                    }
                };

                match phase {
                    PodPhase::Pending => {}
                    PodPhase::Running => {
                        if !announced_running {
                            announced_running = true;
                            publisher
                                .publish(
                                    ExecutionEvent::running(run_id, &job_id)
                                        .with_attempt(attempt)
                                        .with_sequence(1),
                                )
                                .await;
                        }
                    }
                    PodPhase::Succeeded => break ExecutionEvent::succeeded(run_id, &job_id),
                    PodPhase::Failed { exit_code, reason } => {
                        let event = ExecutionEvent::failed(run_id, &job_id, reason);
                        break match exit_code {
                            Some(code) => event.with_exit_code(code),
                            None => event,
                        };
                    }
                    PodPhase::NotFound => {
                        break if canceled.remove(&pod).is_some() {
                            ExecutionEvent::canceled(run_id, &job_id).with_kind(FailureKind::Canceled)
                        } else {
                            ExecutionEvent::failed(run_id, &job_id, "pod disappeared")
                        };
                    }
                }
            };

            debug!(pod = %pod, status = %terminal.status, "pod finished");
            publisher
                .publish(terminal.with_attempt(attempt).with_sequence(2))
                .await;
        });
    }
}

impl From<PodApiError> for SubmitError {
    fn from(err: PodApiError) -> Self {
        match err {
            PodApiError::Unavailable(msg) => Self::Unavailable(msg),
            PodApiError::QuotaExceeded(msg) => Self::QuotaExceeded(msg),
            PodApiError::Rejected(msg) | PodApiError::NotFound(msg) => Self::Rejected(msg),
        }
    }
}

#[async_trait]
impl<C: PodClient> ExecutionBackend for ClusterBackend<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, job: &JobSubmission) -> Result<ExecutionHandle, SubmitError> {
        let manifest = Self::pod_manifest(job, &self.namespace);
        let pod = self.client.create_pod(&manifest).await?;
        info!(
            job_id = %job.job_id,
            attempt = job.attempt,
            namespace = %self.namespace,
            pod = %pod,
            "pod created"
        );
        self.spawn_poller(job, pod.clone());
        Ok(ExecutionHandle::new(pod))
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), CancelError> {
        let pod = handle.as_str();
        self.canceled.insert(pod.to_string());
        match self.client.delete_pod(pod).await {
            Ok(()) | Err(PodApiError::NotFound(_)) => Ok(()),
            Err(PodApiError::Unavailable(msg)) => {
                self.canceled.remove(pod);
                Err(CancelError::Unavailable(msg))
            }
            Err(err) => {
                self.canceled.remove(pod);
                Err(CancelError::Failed(err.to_string()))
            }
        }
    }

    async fn abandon(&self, job: &JobSubmission) -> Result<(), CancelError> {
        let pod = Self::pod_name(job);
        warn!(pod = %pod, "deleting pod of abandoned submission");
        self.cancel(&ExecutionHandle::new(pod)).await
    }
}
