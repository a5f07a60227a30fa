//! Hands Ready jobs to their backends under the concurrency budget.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{persist, ConcurrencyBudget};
use crate::backend::{BackendRegistry, ExecutionBackend, JobSubmission};
use crate::core::{FailureKind, JobFailure, JobStatus};
use crate::errors::{StoreError, SubmitError};
use crate::events::{names, EventSink};
use crate::graph::DependencyGraph;
use crate::store::{PipelineRun, RunStateStore, RunTransaction};
use crate::utils::now_utc;

/// What one dispatch pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Jobs accepted by a backend, in submission order.
    pub submitted: Vec<String>,
    /// Jobs a backend refused; each is now Failed.
    pub rejected: Vec<(String, SubmitError)>,
    /// Ready jobs left for lack of budget.
    pub deferred: usize,
    /// Jobs whose claim lost a compare-and-set; the working copy is stale.
    pub contended: Vec<String>,
}

impl DispatchReport {
    /// Returns true if the working copy must be reloaded from the store.
    #[must_use]
    pub fn needs_resync(&self) -> bool {
        !self.contended.is_empty()
    }
}

/// Submits Ready jobs in dispatch order.
#[derive(Clone)]
pub struct Dispatcher {
    backends: BackendRegistry,
    submit_timeout: Duration,
    sink: Arc<dyn EventSink>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(backends: BackendRegistry, submit_timeout: Duration, sink: Arc<dyn EventSink>) -> Self {
        Self {
            backends,
            submit_timeout,
            sink,
        }
    }

    /// Claims and submits Ready jobs while the budget has room.
    ///
    /// Each claim (Ready to Dispatched) is persisted before `submit` runs, so
    /// a job is never submitted twice. A refused submission marks the job
    /// Failed; propagating that failure is left to the caller.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] other than a conflict if persisting fails.
    pub async fn dispatch(
        &self,
        run: &mut PipelineRun,
        graph: &DependencyGraph,
        budget: &mut ConcurrencyBudget,
        store: &dyn RunStateStore,
    ) -> Result<DispatchReport, StoreError> {
        let mut report = DispatchReport::default();
        let ready: Vec<String> = graph
            .dispatch_order()
            .filter(|id| run.jobs.get(*id).is_some_and(|j| j.status == JobStatus::Ready))
            .map(str::to_string)
            .collect();

        for job_id in ready {
            if !budget.has_capacity() {
                report.deferred += 1;
                continue;
            }
            let Some(node) = graph.node(&job_id) else {
                continue;
            };

            let backend_name = match self.backends.resolve_name(node.execution.backend.as_deref()) {
                Ok(name) => name,
                Err(err) => {
                    self.reject(run, &job_id, None, err, store, &mut report).await?;
                    continue;
                }
            };
            if !budget.has_room(&backend_name) {
                report.deferred += 1;
                continue;
            }

            // Claim.
            let now = now_utc();
            let tx = RunTransaction::begin(run);
            let attempt = {
                let Some(job) = run.jobs.get_mut(&job_id) else {
                    continue;
                };
                job.status = JobStatus::Dispatched;
                job.attempt_count += 1;
                job.backend = Some(backend_name.clone());
                job.handle = None;
                job.dispatched_at = Some(now);
                job.started_at = None;
                job.last_sequence = None;
                job.attempt_count
            };
            run.refresh(now);
            match persist(store, tx, run).await {
                Ok(_) => {}
                Err(err) if err.is_conflict() => {
                    warn!(run_id = %run.id, job_id = %job_id, error = %err, "lost claim on job");
                    report.contended.push(job_id);
                    return Ok(report);
                }
                Err(err) => return Err(err),
            }
            budget.try_acquire(&backend_name);

            let Some(backend) = self.backends.get(&backend_name) else {
                budget.release(&backend_name);
                let err = SubmitError::UnknownBackend(backend_name.clone());
                self.reject(run, &job_id, Some(attempt), err, store, &mut report).await?;
                continue;
            };

            let submission = JobSubmission {
                run_id: run.id,
                pipeline: run.pipeline.clone(),
                job_id: job_id.clone(),
                stage: node.stage.clone(),
                attempt,
                spec: node.execution.clone(),
            };

            let outcome = match tokio::time::timeout(self.submit_timeout, backend.submit(&submission)).await {
                Ok(result) => result,
                Err(_) => {
                    self.abandon(Arc::clone(&backend), submission);
                    Err(SubmitError::Timeout {
                        after_ms: u64::try_from(self.submit_timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            };

            match outcome {
                Ok(handle) => {
                    info!(
                        run_id = %run.id,
                        job_id = %job_id,
                        attempt,
                        backend = %backend_name,
                        handle = %handle,
                        "job submitted"
                    );
                    let tx = RunTransaction::begin(run);
                    if let Some(job) = run.jobs.get_mut(&job_id) {
                        job.handle = Some(handle.clone());
                    }
                    match persist(store, tx, run).await {
                        Ok(_) => {}
                        Err(err) if err.is_conflict() => {
                            report.contended.push(job_id);
                            return Ok(report);
                        }
                        Err(err) => return Err(err),
                    }
                    self.sink.try_emit(
                        names::JOB_SUBMITTED,
                        Some(json!({
                            "run_id": run.id,
                            "job_id": job_id,
                            "attempt": attempt,
                            "backend": backend_name,
                            "handle": handle,
                        })),
                    );
                    report.submitted.push(job_id);
                }
                Err(err) => {
                    budget.release(&backend_name);
                    self.reject(run, &job_id, Some(attempt), err, store, &mut report).await?;
                }
            }
        }

        if report.deferred > 0 {
            debug!(run_id = %run.id, deferred = report.deferred, "ready jobs waiting for budget");
        }
        Ok(report)
    }

    /// Cleans up a timed-out submission in the background.
    ///
    /// The backend may have started the attempt before the call was dropped.
    fn abandon(&self, backend: Arc<dyn ExecutionBackend>, submission: JobSubmission) {
        let limit = self.submit_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(limit, backend.abandon(&submission)).await {
                Ok(Ok(())) => {
                    debug!(run_id = %submission.run_id, job_id = %submission.job_id, "abandoned submission cleaned up");
                }
                Ok(Err(err)) => {
                    warn!(run_id = %submission.run_id, job_id = %submission.job_id, error = %err, "abandoned submission cleanup failed");
                }
                Err(_) => {
                    warn!(run_id = %submission.run_id, job_id = %submission.job_id, "abandoned submission cleanup timed out");
                }
            }
        });
    }

    async fn reject(
        &self,
        run: &mut PipelineRun,
        job_id: &str,
        attempt: Option<u32>,
        err: SubmitError,
        store: &dyn RunStateStore,
        report: &mut DispatchReport,
    ) -> Result<(), StoreError> {
        warn!(run_id = %run.id, job_id = %job_id, error = %err, "submission rejected");
        let now = now_utc();
        let tx = RunTransaction::begin(run);
        if let Some(job) = run.jobs.get_mut(job_id) {
            let attempt = attempt.unwrap_or(job.attempt_count);
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);
            job.failure = Some(JobFailure::new(FailureKind::Submit, err.to_string(), attempt).at(now));
        }
        run.refresh(now);

        match persist(store, tx, run).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                report.contended.push(job_id.to_string());
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.sink.try_emit(
            names::JOB_REJECTED,
            Some(json!({"run_id": run.id, "job_id": job_id, "error": err.to_string()})),
        );
        report.rejected.push((job_id.to_string(), err));
        Ok(())
    }
}
