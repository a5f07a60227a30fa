//! The per-run scheduling loop.

use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{persist, ConcurrencyBudget, Dispatcher, EventReconciler, Propagation, Reconciled, SchedulerContext};
use crate::cancellation::CancellationToken;
use crate::core::{ExecutionEvent, FailureKind, JobStatus};
use crate::errors::{ConfigurationError, ConveyorError, StoreError};
use crate::events::names;
use crate::graph::DependencyGraph;
use crate::store::{PipelineRun, RunTransaction};
use crate::utils::{add_duration, now_utc, until, Timestamp};

/// Upper bound on advance passes per tick.
const MAX_ADVANCE_PASSES: usize = 64;

/// Upper bound on re-applying one change after a lost compare-and-set.
const MAX_CONFLICT_RETRIES: usize = 2;

enum Wake {
    Cancel,
    Event(ExecutionEvent),
    Closed,
    Timer,
}

/// Drives one run from its current state until every job is terminal.
///
/// The core owns the run's working copy. Nothing else writes to it, so the
/// only conflicts it sees come from another process holding the same run.
pub struct SchedulerCore {
    ctx: SchedulerContext,
    graph: DependencyGraph,
    run: PipelineRun,
    budget: ConcurrencyBudget,
    reconciler: EventReconciler,
    dispatcher: Dispatcher,
    events: mpsc::Receiver<ExecutionEvent>,
    events_closed: bool,
    cancel: Arc<CancellationToken>,
}

impl SchedulerCore {
    /// Creates a core for `run`, which must already exist in the store.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the run's recorded definition is
    /// not a valid graph.
    pub fn new(
        ctx: SchedulerContext,
        run: PipelineRun,
        events: mpsc::Receiver<ExecutionEvent>,
        cancel: Arc<CancellationToken>,
    ) -> Result<Self, ConfigurationError> {
        let graph = DependencyGraph::from_definition(&run.definition);
        graph.validate()?;

        let config = &ctx.config;
        let budget = ConcurrencyBudget::new(config.max_parallel_jobs, config.per_backend_limits.clone());
        let reconciler = EventReconciler::new(config.backoff, config.continue_on_stage_failure);
        let dispatcher = Dispatcher::new(ctx.backends.clone(), config.submit_timeout(), ctx.sink.clone());

        Ok(Self {
            ctx,
            graph,
            run,
            budget,
            reconciler,
            dispatcher,
            events,
            events_closed: false,
            cancel,
        })
    }

    /// The run's id.
    #[must_use]
    pub fn run_id(&self) -> uuid::Uuid {
        self.run.id
    }

    /// Runs to completion and returns the final record.
    ///
    /// # Errors
    ///
    /// Returns a [`ConveyorError::Store`] if the store fails in a way that
    /// is not a version conflict. The run is left as last persisted and can
    /// be resumed by recovery.
    pub async fn run(mut self) -> Result<PipelineRun, ConveyorError> {
        self.start().await?;

        loop {
            if (self.cancel.is_cancelled() || self.run.cancel_requested()) && !self.run.is_settled() {
                self.cancel_everything().await?;
            }

            self.tick().await?;
            if self.run.is_settled() {
                return self.finish().await;
            }

            match self.wait_for_activity().await {
                Wake::Event(event) => {
                    self.apply_event(event).await?;
                    while let Ok(event) = self.events.try_recv() {
                        self.apply_event(event).await?;
                    }
                }
                Wake::Closed => {
                    debug!(run_id = %self.run.id, "event route closed, relying on timers");
                    self.events_closed = true;
                }
                Wake::Cancel | Wake::Timer => {}
            }
        }
    }

    async fn start(&mut self) -> Result<(), ConveyorError> {
        let now = now_utc();
        let tx = RunTransaction::begin(&self.run);
        if self.run.started_at.is_none() {
            self.run.started_at = Some(now);
        }
        self.run.refresh(now);
        self.commit(tx).await?;
        self.budget.rebuild(&self.run);

        info!(run_id = %self.run.id, pipeline = %self.run.pipeline, jobs = self.run.jobs.len(), "run started");
        self.ctx.sink.try_emit(
            names::RUN_STARTED,
            Some(json!({
                "run_id": self.run.id,
                "pipeline": self.run.pipeline,
                "revision": self.run.revision,
            })),
        );

        // A claim persisted without a handle means the previous owner stopped
        // between claiming and recording the submission outcome.
        let interrupted: Vec<ExecutionEvent> = self
            .run
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Dispatched && j.handle.is_none())
            .map(|j| {
                ExecutionEvent::failed(self.run.id, j.job_id.clone(), "submission outcome lost on restart")
                    .with_kind(FailureKind::Interrupted)
                    .with_attempt(j.attempt_count)
                    .with_idempotency_key(format!("interrupted:{}:{}", j.job_id, j.attempt_count))
            })
            .collect();
        for event in interrupted {
            warn!(run_id = %self.run.id, job_id = %event.job_id, "recovering interrupted submission");
            self.apply_event(event).await?;
        }
        Ok(())
    }

    async fn finish(mut self) -> Result<PipelineRun, ConveyorError> {
        let now = now_utc();
        let tx = RunTransaction::begin(&self.run);
        self.run.refresh(now);
        self.commit(tx).await?;

        let duration_ms = match (self.run.started_at, self.run.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        };
        info!(run_id = %self.run.id, status = %self.run.status, duration_ms, "run finished");
        self.ctx.sink.try_emit(
            names::RUN_FINISHED,
            Some(json!({
                "run_id": self.run.id,
                "pipeline": self.run.pipeline,
                "status": self.run.status,
                "duration_ms": duration_ms,
            })),
        );
        Ok(self.run)
    }

    /// One scheduling turn: retries, timeouts, then dispatch until quiet.
    async fn tick(&mut self) -> Result<(), ConveyorError> {
        let now = now_utc();
        self.promote_due_retries(now).await?;
        self.fire_timeouts(now).await?;

        for _ in 0..MAX_ADVANCE_PASSES {
            if !self.advance().await? {
                break;
            }
        }
        Ok(())
    }

    async fn promote_due_retries(&mut self, now: Timestamp) -> Result<(), ConveyorError> {
        let due: Vec<String> = self
            .run
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Retrying && j.retry_at.map_or(true, |at| at <= now))
            .map(|j| j.job_id.clone())
            .collect();
        if due.is_empty() {
            return Ok(());
        }

        let tx = RunTransaction::begin(&self.run);
        for id in &due {
            if let Some(job) = self.run.jobs.get_mut(id) {
                job.status = JobStatus::Pending;
                job.retry_at = None;
                debug!(run_id = %self.run.id, job_id = %id, attempt = job.attempt_count + 1, "retry due");
            }
        }
        self.run.refresh(now);
        self.commit(tx).await?;
        Ok(())
    }

    async fn fire_timeouts(&mut self, now: Timestamp) -> Result<(), ConveyorError> {
        let expired: Vec<ExecutionEvent> = self
            .run
            .jobs
            .values()
            .filter(|j| j.status.is_in_flight())
            .filter_map(|j| {
                let deadline = self.deadline_of(&j.job_id)?;
                (deadline <= now).then(|| {
                    let secs = self.graph.node(&j.job_id).and_then(|n| n.execution.timeout_secs).unwrap_or(0);
                    ExecutionEvent::failed(self.run.id, j.job_id.clone(), format!("exceeded timeout of {secs}s"))
                        .with_kind(FailureKind::Timeout)
                        .with_attempt(j.attempt_count)
                        .with_idempotency_key(format!("timeout:{}:{}", j.job_id, j.attempt_count))
                })
            })
            .collect();

        for event in expired {
            warn!(run_id = %self.run.id, job_id = %event.job_id, attempt = ?event.attempt, "job timed out");
            self.apply_event(event).await?;
        }
        Ok(())
    }

    /// When the job's current attempt times out, if it has a timeout.
    fn deadline_of(&self, job_id: &str) -> Option<Timestamp> {
        let secs = self.graph.node(job_id)?.execution.timeout_secs?;
        let job = self.run.jobs.get(job_id)?;
        let from = job.started_at.or(job.dispatched_at)?;
        Some(add_duration(from, Duration::from_secs(secs)))
    }

    /// Promotes newly ready jobs, cancels doomed ones, and dispatches.
    ///
    /// Returns true if anything changed.
    async fn advance(&mut self) -> Result<bool, ConveyorError> {
        if self.run.cancel_requested() {
            return Ok(false);
        }

        let now = now_utc();
        let ready_set = self.graph.ready_set(&self.run.statuses());
        let mut progressed = false;

        if !ready_set.is_empty() {
            let tx = RunTransaction::begin(&self.run);
            let doomed = self.reconciler.cancel_doomed(&mut self.run, &ready_set.doomed, now);
            for id in &ready_set.ready {
                if let Some(job) = self.run.jobs.get_mut(id) {
                    job.status = JobStatus::Ready;
                }
            }
            self.run.refresh(now);
            if !self.commit(tx).await? {
                return Ok(true);
            }
            self.apply_effects(doomed).await;
            progressed = true;
        }

        let has_ready = self.run.jobs.values().any(|j| j.status == JobStatus::Ready);
        if !has_ready || !self.budget.has_capacity() {
            return Ok(progressed);
        }

        let report = self
            .dispatcher
            .dispatch(&mut self.run, &self.graph, &mut self.budget, self.ctx.store.as_ref())
            .await?;

        for (job_id, _) in &report.rejected {
            self.propagate(job_id).await?;
        }
        if report.needs_resync() {
            self.resync().await?;
            return Ok(true);
        }

        Ok(progressed || !report.submitted.is_empty() || !report.rejected.is_empty())
    }

    async fn propagate(&mut self, job_id: &str) -> Result<(), ConveyorError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let now = now_utc();
            let tx = RunTransaction::begin(&self.run);
            let effects = self.reconciler.propagate_failure(&mut self.run, &self.graph, job_id, now);
            self.run.refresh(now);
            if self.commit(tx).await? {
                self.apply_effects(effects).await;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn cancel_everything(&mut self) -> Result<(), ConveyorError> {
        let reason = self
            .cancel
            .reason()
            .or_else(|| self.run.cancel_reason.clone())
            .unwrap_or_else(|| "canceled".to_string());

        for _ in 0..MAX_CONFLICT_RETRIES {
            let now = now_utc();
            let tx = RunTransaction::begin(&self.run);
            let effects = self.reconciler.cancel_all(&mut self.run, &self.graph, &reason, now);
            if self.commit(tx).await? {
                info!(run_id = %self.run.id, reason = %reason, canceled = effects.canceled.len(), "run canceled");
                self.apply_effects(effects).await;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn wait_for_activity(&mut self) -> Wake {
        let sleep_for = self.next_wake_in(now_utc());
        let cancel = self.cancel.clone();
        let watch_cancel = !cancel.is_cancelled();
        let watch_events = !self.events_closed;

        tokio::select! {
            () = cancel.cancelled(), if watch_cancel => Wake::Cancel,
            event = self.events.recv(), if watch_events => match event {
                Some(event) => Wake::Event(event),
                None => Wake::Closed,
            },
            () = tokio::time::sleep(sleep_for) => Wake::Timer,
        }
    }

    /// Time until the next retry or timeout is due, capped by the poll interval.
    fn next_wake_in(&self, now: Timestamp) -> Duration {
        let retries = self.run.jobs.values().filter_map(|j| j.retry_at);
        let deadlines = self
            .run
            .jobs
            .values()
            .filter(|j| j.status.is_in_flight())
            .filter_map(|j| self.deadline_of(&j.job_id));

        retries
            .chain(deadlines)
            .map(|at| until(now, at))
            .fold(self.ctx.config.poll_interval(), Duration::min)
    }

    async fn apply_event(&mut self, event: ExecutionEvent) -> Result<(), ConveyorError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let now = now_utc();
            let tx = RunTransaction::begin(&self.run);
            match self.reconciler.apply(&mut self.run, &self.graph, &event, now) {
                Reconciled::Applied(change) => {
                    if !self.commit(tx).await? {
                        continue;
                    }
                    let attempt = self.run.job(&change.job_id).map_or(0, |j| j.attempt_count);
                    info!(
                        run_id = %self.run.id,
                        job_id = %change.job_id,
                        attempt,
                        from = %change.from,
                        status = %change.to,
                        "job transition"
                    );
                    self.ctx.sink.try_emit(
                        names::JOB_TRANSITION,
                        Some(json!({
                            "run_id": self.run.id,
                            "job_id": change.job_id,
                            "attempt": attempt,
                            "from": change.from,
                            "to": change.to,
                        })),
                    );
                    if let Some(retry_at) = change.retry_at {
                        self.ctx.sink.try_emit(
                            names::JOB_RETRY_SCHEDULED,
                            Some(json!({
                                "run_id": self.run.id,
                                "job_id": change.job_id,
                                "attempt": attempt,
                                "retry_at": retry_at,
                            })),
                        );
                    }
                    self.apply_effects(change.effects).await;
                    return Ok(());
                }
                Reconciled::Duplicate { key } => {
                    debug!(run_id = %self.run.id, job_id = %event.job_id, key = %key, "duplicate event");
                    self.ctx.sink.try_emit(
                        names::EVENT_DUPLICATE,
                        Some(json!({"run_id": self.run.id, "job_id": event.job_id, "key": key})),
                    );
                    return Ok(());
                }
                Reconciled::Stale { reason } => {
                    debug!(run_id = %self.run.id, job_id = %event.job_id, reason = %reason, "stale event");
                    self.ctx.sink.try_emit(
                        names::EVENT_STALE,
                        Some(json!({"run_id": self.run.id, "job_id": event.job_id, "reason": reason})),
                    );
                    return Ok(());
                }
                Reconciled::UnknownJob => {
                    warn!(run_id = %self.run.id, job_id = %event.job_id, "event for unknown job");
                    return Ok(());
                }
                Reconciled::UnknownRun => {
                    warn!(run_id = %event.run_id, job_id = %event.job_id, "event routed to the wrong run");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Releases slots, reports cancellations, and sends backend cancels.
    async fn apply_effects(&mut self, effects: Propagation) {
        for backend in &effects.released {
            self.budget.release(backend);
        }
        for job_id in &effects.canceled {
            self.ctx.sink.try_emit(
                names::JOB_CANCELED,
                Some(json!({"run_id": self.run.id, "job_id": job_id})),
            );
        }
        if effects.cancellations.is_empty() {
            return;
        }

        let timeout = self.ctx.config.submit_timeout();
        let sends = effects.cancellations.iter().filter_map(|order| {
            let backend = self.ctx.backends.get(&order.backend)?;
            Some(async move {
                let outcome = tokio::time::timeout(timeout, backend.cancel(&order.handle)).await;
                (order, outcome)
            })
        });

        for (order, outcome) in join_all(sends).await {
            match outcome {
                Ok(Ok(())) => {
                    debug!(run_id = %self.run.id, job_id = %order.job_id, handle = %order.handle, "backend cancel sent");
                }
                Ok(Err(err)) => {
                    warn!(run_id = %self.run.id, job_id = %order.job_id, error = %err, "backend cancel failed");
                }
                Err(_) => {
                    warn!(run_id = %self.run.id, job_id = %order.job_id, "backend cancel timed out");
                }
            }
        }
    }

    /// Persists `tx`. Returns false if it lost a compare-and-set, in which
    /// case the working copy has been reloaded.
    async fn commit(&mut self, tx: RunTransaction) -> Result<bool, ConveyorError> {
        match persist(self.ctx.store.as_ref(), tx, &mut self.run).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_conflict() => {
                warn!(run_id = %self.run.id, error = %err, "run changed underneath us, reloading");
                self.resync().await?;
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn resync(&mut self) -> Result<(), ConveyorError> {
        let run = self
            .ctx
            .store
            .load(self.run.id)
            .await?
            .ok_or(StoreError::NotFound(self.run.id))?;
        self.run = run;
        self.budget.rebuild(&self.run);
        Ok(())
    }
}

impl std::fmt::Debug for SchedulerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerCore")
            .field("run_id", &self.run.id)
            .field("status", &self.run.status)
            .field("in_flight", &self.budget.in_flight())
            .finish_non_exhaustive()
    }
}
