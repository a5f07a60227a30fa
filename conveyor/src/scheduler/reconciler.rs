//! Applies execution events to a run's working copy.
//!
//! The reconciler is synchronous and side-effect free: it mutates the
//! working copy and returns what the caller must do once the resulting
//! delta is persisted (release budget slots, send backend cancels).

use std::collections::BTreeSet;
use tracing::debug;

use super::BackoffPolicy;
use crate::backend::ExecutionHandle;
use crate::core::{ExecutionEvent, FailureKind, JobFailure, JobStatus, ReportedStatus};
use crate::graph::DependencyGraph;
use crate::store::{JobRun, PipelineRun};
use crate::utils::{add_duration, Timestamp};

/// A backend cancel to issue after persisting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOrder {
    /// Job being canceled.
    pub job_id: String,
    /// Backend running it.
    pub backend: String,
    /// Backend reference of the attempt.
    pub handle: ExecutionHandle,
}

/// Jobs canceled as a consequence of another change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Propagation {
    /// Jobs moved to Canceled.
    pub canceled: Vec<String>,
    /// Backend cancels for the ones that were in flight.
    pub cancellations: Vec<CancelOrder>,
    /// Backends whose budget slot is freed, one entry per slot.
    pub released: Vec<String>,
}

impl Propagation {
    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.canceled.is_empty() && self.released.is_empty()
    }

    fn merge(&mut self, other: Self) {
        self.canceled.extend(other.canceled);
        self.cancellations.extend(other.cancellations);
        self.released.extend(other.released);
    }
}

/// An applied transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Job the event was about.
    pub job_id: String,
    /// Status before.
    pub from: JobStatus,
    /// Status after.
    pub to: JobStatus,
    /// When a Retrying job becomes eligible again.
    pub retry_at: Option<Timestamp>,
    /// Follow-up work.
    pub effects: Propagation,
}

/// Outcome of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// The event changed the run.
    Applied(Reconciliation),
    /// The event's idempotency key was already applied.
    Duplicate {
        /// The repeated key.
        key: String,
    },
    /// The event refers to an older attempt or an impossible transition.
    Stale {
        /// Why the event was ignored.
        reason: String,
    },
    /// The run has no such job.
    UnknownJob,
    /// The event belongs to another run.
    UnknownRun,
}

/// Event application rules.
#[derive(Debug, Clone)]
pub struct EventReconciler {
    backoff: BackoffPolicy,
    continue_on_stage_failure: bool,
}

impl EventReconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(backoff: BackoffPolicy, continue_on_stage_failure: bool) -> Self {
        Self {
            backoff,
            continue_on_stage_failure,
        }
    }

    /// Applies `event` to `run`.
    ///
    /// Nothing is mutated unless the outcome is [`Reconciled::Applied`].
    pub fn apply(
        &self,
        run: &mut PipelineRun,
        graph: &DependencyGraph,
        event: &ExecutionEvent,
        now: Timestamp,
    ) -> Reconciled {
        if event.run_id != run.id {
            return Reconciled::UnknownRun;
        }
        let Some(job) = run.jobs.get_mut(&event.job_id) else {
            return Reconciled::UnknownJob;
        };

        let key = event.idempotency_key(job.attempt_count);
        if job.applied_keys.contains(&key) {
            return Reconciled::Duplicate { key };
        }
        if let Some(attempt) = event.attempt {
            if attempt != job.attempt_count {
                return Reconciled::Stale {
                    reason: format!("event for attempt {attempt}, job is on attempt {}", job.attempt_count),
                };
            }
        }
        if let (Some(seq), Some(last)) = (event.sequence, job.last_sequence) {
            if seq <= last {
                return Reconciled::Stale {
                    reason: format!("sequence {seq} not after {last}"),
                };
            }
        }

        let from = job.status;
        let in_flight = from.is_in_flight();
        let mut effects = Propagation::default();
        let mut retry_at = None;
        let mut propagate = false;

        match (from, event.status) {
            (JobStatus::Dispatched, ReportedStatus::Running) => {
                job.status = JobStatus::Running;
                job.started_at = Some(now);
            }
            (_, ReportedStatus::Succeeded) if in_flight => {
                job.status = JobStatus::Succeeded;
                job.exit_code = event.exit_code.or(Some(0));
                job.finished_at = Some(now);
                effects.released.extend(job.backend.clone());
            }
            (_, ReportedStatus::Failed) if in_flight => {
                retry_at = self.record_failure(job, event, now, &mut effects);
                propagate = retry_at.is_none();
            }
            (_, ReportedStatus::Canceled) if in_flight => {
                job.status = JobStatus::Canceled;
                job.exit_code = event.exit_code;
                job.finished_at = Some(now);
                job.failure = Some(
                    JobFailure::new(
                        FailureKind::Canceled,
                        event.error.clone().unwrap_or_else(|| "canceled by backend".to_string()),
                        job.attempt_count,
                    )
                    .with_exit_code(event.exit_code)
                    .at(now),
                );
                effects.released.extend(job.backend.clone());
                propagate = true;
            }
            (from, reported) => {
                return Reconciled::Stale {
                    reason: format!("{reported} event not applicable to {from} job"),
                };
            }
        }

        job.applied_keys.insert(key);
        if event.sequence.is_some() {
            job.last_sequence = event.sequence;
        }
        let to = job.status;

        if propagate {
            effects.merge(self.propagate_failure(run, graph, &event.job_id, now));
        }
        run.refresh(now);

        debug!(run_id = %run.id, job_id = %event.job_id, from = %from, to = %to, "applied execution event");
        Reconciled::Applied(Reconciliation {
            job_id: event.job_id.clone(),
            from,
            to,
            retry_at,
            effects,
        })
    }

    /// Records a failed attempt. Returns the retry time if the job will be retried.
    fn record_failure(
        &self,
        job: &mut JobRun,
        event: &ExecutionEvent,
        now: Timestamp,
        effects: &mut Propagation,
    ) -> Option<Timestamp> {
        let kind = event.kind.unwrap_or(FailureKind::Execution);
        let message = event.error.clone().unwrap_or_else(|| match event.exit_code {
            Some(code) => format!("exited with code {code}"),
            None => "job failed".to_string(),
        });
        job.failure = Some(
            JobFailure::new(kind, message, job.attempt_count)
                .with_exit_code(event.exit_code)
                .at(now),
        );
        job.exit_code = event.exit_code;

        if let Some(backend) = job.backend.clone() {
            // A timed-out attempt may still be running.
            if kind == FailureKind::Timeout {
                if let Some(handle) = job.handle.clone() {
                    effects.cancellations.push(CancelOrder {
                        job_id: job.job_id.clone(),
                        backend: backend.clone(),
                        handle,
                    });
                }
            }
            effects.released.push(backend);
        }

        let retryable = matches!(
            kind,
            FailureKind::Execution | FailureKind::Timeout | FailureKind::Interrupted
        );
        if retryable && job.retries_remaining > 0 {
            job.retries_remaining -= 1;
            job.status = JobStatus::Retrying;
            let at = add_duration(now, self.backoff.delay_for(job.attempt_count));
            job.retry_at = Some(at);
            return Some(at);
        }

        job.status = JobStatus::Failed;
        job.finished_at = Some(now);
        None
    }

    /// Cancels everything a failure of `job_id` makes pointless.
    ///
    /// That is every transitive dependent, plus the job's same-stage
    /// siblings unless the stage continues on failure.
    pub fn propagate_failure(
        &self,
        run: &mut PipelineRun,
        graph: &DependencyGraph,
        job_id: &str,
        now: Timestamp,
    ) -> Propagation {
        let mut targets: BTreeSet<String> = graph.descendants(job_id);
        let stage = run.jobs.get(job_id).map(|j| j.stage.clone()).unwrap_or_default();
        if !graph.continues_on_failure(&stage, self.continue_on_stage_failure) {
            targets.extend(graph.siblings(job_id));
        }

        let mut ordered: Vec<String> = targets.into_iter().collect();
        ordered.sort_by_key(|id| graph.dispatch_rank(id));

        let reason = format!("'{job_id}' did not succeed");
        let mut propagation = Propagation::default();
        for id in ordered {
            Self::cancel_job(run, &id, &reason, now, &mut propagation);
        }
        propagation
    }

    /// Cancels pending jobs that can no longer run.
    pub fn cancel_doomed(&self, run: &mut PipelineRun, doomed: &[String], now: Timestamp) -> Propagation {
        let mut propagation = Propagation::default();
        for id in doomed {
            Self::cancel_job(run, id, "a dependency did not succeed", now, &mut propagation);
        }
        propagation
    }

    /// Cancels every non-terminal job and marks the run canceled.
    pub fn cancel_all(
        &self,
        run: &mut PipelineRun,
        graph: &DependencyGraph,
        reason: &str,
        now: Timestamp,
    ) -> Propagation {
        if run.cancel_reason.is_none() {
            run.cancel_reason = Some(reason.to_string());
        }
        let ids: Vec<String> = graph.dispatch_order().map(str::to_string).collect();
        let mut propagation = Propagation::default();
        for id in ids {
            Self::cancel_job(run, &id, reason, now, &mut propagation);
        }
        run.refresh(now);
        propagation
    }

    fn cancel_job(run: &mut PipelineRun, job_id: &str, reason: &str, now: Timestamp, out: &mut Propagation) {
        let Some(job) = run.jobs.get_mut(job_id) else {
            return;
        };
        if job.status.is_terminal() {
            return;
        }

        if job.status.is_in_flight() {
            if let Some(backend) = job.backend.clone() {
                out.released.push(backend.clone());
                if let Some(handle) = job.handle.clone() {
                    out.cancellations.push(CancelOrder {
                        job_id: job_id.to_string(),
                        backend,
                        handle,
                    });
                }
            }
        }

        job.status = JobStatus::Canceled;
        job.retry_at = None;
        job.finished_at = Some(now);
        job.failure = Some(JobFailure::new(FailureKind::Canceled, reason, job.attempt_count).at(now));
        out.canceled.push(job_id.to_string());
        run.refresh(now);
    }
}
