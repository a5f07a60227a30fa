//! Multi-run front door.
//!
//! The [`Engine`] starts runs, routes the shared execution event stream to
//! each run's scheduler task, bounds how many runs are coordinated at once,
//! and handles cancellation, status queries, and recovery after a restart.

use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::core::ExecutionEvent;
use crate::errors::ConveyorError;
use crate::events::{names, EventSink, EventStream};
use crate::graph::{DependencyGraph, PipelineDefinition};
use crate::scheduler::{SchedulerContext, SchedulerCore};
use crate::store::{PipelineRun, RunTransaction, Trigger};
use crate::utils::{generate_run_id, now_utc};

type Routes = Arc<DashMap<Uuid, mpsc::Sender<ExecutionEvent>>>;
type Cancels = Arc<DashMap<Uuid, Arc<CancellationToken>>>;

/// A started run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    join: JoinHandle<Result<PipelineRun, ConveyorError>>,
}

impl RunHandle {
    /// The run's id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Waits for the run to finish and returns its final record.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the run's scheduler, or
    /// [`ConveyorError::Internal`] if its task panicked or was aborted.
    pub async fn wait(self) -> Result<PipelineRun, ConveyorError> {
        self.join
            .await
            .map_err(|err| ConveyorError::Internal(format!("run task failed: {err}")))?
    }
}

/// Coordinates every run of one process.
pub struct Engine {
    ctx: SchedulerContext,
    routes: Routes,
    cancels: Cancels,
    permits: Arc<Semaphore>,
    router: JoinHandle<()>,
}

impl Engine {
    /// Creates an engine reading execution events from `events`.
    ///
    /// Must be called inside a tokio runtime; the event router is spawned
    /// immediately.
    #[must_use]
    pub fn new(ctx: SchedulerContext, events: EventStream) -> Self {
        let routes: Routes = Arc::new(DashMap::new());
        let permits = Arc::new(Semaphore::new(ctx.config.max_active_runs.max(1)));
        let router = tokio::spawn(route_events(events, routes.clone(), ctx.sink.clone()));

        Self {
            ctx,
            routes,
            cancels: Arc::new(DashMap::new()),
            permits,
            router,
        }
    }

    /// Shared collaborators.
    #[must_use]
    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    /// Validates `definition`, records a new run, and starts scheduling it.
    ///
    /// # Errors
    ///
    /// Returns [`ConveyorError::Configuration`] if the definition is invalid
    /// (nothing is recorded), or [`ConveyorError::Store`] if the run could
    /// not be created.
    pub async fn start_run(
        &self,
        definition: PipelineDefinition,
        revision: impl Into<String>,
        trigger: Trigger,
    ) -> Result<RunHandle, ConveyorError> {
        let graph = DependencyGraph::from_definition(&definition);
        if let Err(err) = graph.validate() {
            warn!(pipeline = %definition.name, code = %err.info.code, "rejected pipeline definition");
            return Err(err.into());
        }

        let run = PipelineRun::new(generate_run_id(), &graph, revision, trigger, now_utc());
        self.ctx.store.create(&run).await?;

        info!(run_id = %run.id, pipeline = %run.pipeline, revision = %run.revision, "run created");
        self.ctx.sink.try_emit(
            names::RUN_CREATED,
            Some(json!({
                "run_id": run.id,
                "pipeline": run.pipeline,
                "revision": run.revision,
                "trigger": run.trigger,
                "jobs": run.jobs.len(),
            })),
        );

        self.launch(run)
    }

    /// Requests cancellation of a run.
    ///
    /// A run owned by this engine is canceled by its scheduler task. A run
    /// that is active in the store but not owned here has the request
    /// recorded, to be carried out by whichever engine recovers it. Canceling
    /// a finished run is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ConveyorError::UnknownRun`] if no such run exists, or a
    /// store error if the request could not be recorded.
    pub async fn cancel_run(&self, run_id: Uuid, reason: impl Into<String>) -> Result<(), ConveyorError> {
        let reason = reason.into();
        let token = self.cancels.get(&run_id).map(|t| t.value().clone());
        if let Some(token) = token {
            if token.cancel(reason.clone()) {
                info!(run_id = %run_id, reason = %reason, "cancel requested");
                self.ctx.sink.try_emit(
                    names::RUN_CANCEL_REQUESTED,
                    Some(json!({"run_id": run_id, "reason": reason})),
                );
            }
            return Ok(());
        }

        let Some(mut run) = self.ctx.store.load(run_id).await? else {
            return Err(ConveyorError::UnknownRun(run_id));
        };
        if !run.is_active() || run.cancel_requested() {
            return Ok(());
        }

        let tx = RunTransaction::begin(&run);
        run.cancel_reason = Some(reason.clone());
        run.refresh(now_utc());
        if let Some(delta) = tx.commit(&mut run) {
            self.ctx.store.save(&delta).await?;
        }
        info!(run_id = %run_id, reason = %reason, "cancel recorded for unowned run");
        self.ctx.sink.try_emit(
            names::RUN_CANCEL_REQUESTED,
            Some(json!({"run_id": run_id, "reason": reason})),
        );
        Ok(())
    }

    /// Returns the stored record of a run.
    ///
    /// Reads go to the store, so this is safe while the run is active.
    ///
    /// # Errors
    ///
    /// Returns a store error if the store is unavailable.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>, ConveyorError> {
        Ok(self.ctx.store.load(run_id).await?)
    }

    /// Resumes every active run in the store that this engine does not own.
    ///
    /// Runs whose recorded definition no longer validates are skipped.
    ///
    /// # Errors
    ///
    /// Returns a store error if active runs cannot be listed or loaded.
    pub async fn recover(&self) -> Result<Vec<RunHandle>, ConveyorError> {
        let mut handles = Vec::new();
        for run_id in self.ctx.store.list_active_runs().await? {
            if self.routes.contains_key(&run_id) {
                continue;
            }
            let Some(run) = self.ctx.store.load(run_id).await? else {
                continue;
            };
            if !run.is_active() {
                continue;
            }
            info!(run_id = %run_id, pipeline = %run.pipeline, status = %run.status, "recovering run");
            match self.launch(run) {
                Ok(handle) => handles.push(handle),
                Err(err) => error!(run_id = %run_id, error = %err, "cannot recover run"),
            }
        }
        Ok(handles)
    }

    /// Ids of runs currently owned by this engine.
    #[must_use]
    pub fn active_runs(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.routes.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    fn launch(&self, run: PipelineRun) -> Result<RunHandle, ConveyorError> {
        let run_id = run.id;
        let (tx, rx) = mpsc::channel(self.ctx.config.event_channel_capacity.max(1));
        let token = Arc::new(CancellationToken::new());
        let core = SchedulerCore::new(self.ctx.clone(), run, rx, token.clone())?;

        // Registered before spawning so no event for this run is dropped.
        self.routes.insert(run_id, tx);
        self.cancels.insert(run_id, token);

        let routes = self.routes.clone();
        let cancels = self.cancels.clone();
        let permits = self.permits.clone();
        let span = info_span!("run", run_id = %run_id);

        let join = tokio::spawn(
            async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => core.run().await,
                    Err(_) => Err(ConveyorError::Internal("engine shut down".to_string())),
                };
                routes.remove(&run_id);
                cancels.remove(&run_id);
                if let Err(ref err) = result {
                    error!(error = %err, "run stopped");
                }
                result
            }
            .instrument(span),
        );

        Ok(RunHandle { run_id, join })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.router.abort();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("active_runs", &self.routes.len())
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

/// Forwards each event to its run's channel.
///
/// A full run channel is drained by a spawned send so one slow run does not
/// hold up the others; the reconciler's sequence checks absorb reordering.
async fn route_events(mut events: EventStream, routes: Routes, sink: Arc<dyn EventSink>) {
    while let Some(event) = events.recv().await {
        let route = routes.get(&event.run_id).map(|r| r.value().clone());
        let Some(route) = route else {
            unknown_run(&event, sink.as_ref());
            continue;
        };
        match route.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tokio::spawn(async move {
                    let _ = route.send(event).await;
                });
            }
            Err(TrySendError::Closed(event)) => unknown_run(&event, sink.as_ref()),
        }
    }
}

fn unknown_run(event: &ExecutionEvent, sink: &dyn EventSink) {
    warn!(run_id = %event.run_id, job_id = %event.job_id, status = %event.status, "event for unknown run");
    sink.try_emit(
        names::EVENT_UNKNOWN_RUN,
        Some(json!({"run_id": event.run_id, "job_id": event.job_id, "status": event.status})),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use crate::config::SchedulerConfig;
    use crate::core::{JobStatus, RunStatus};
    use crate::events::{event_channel, CollectingEventSink};
    use crate::graph::{JobDefinition, PipelineBuilder};
    use crate::store::{InMemoryRunStore, RunStateStore};
    use crate::testing::{ScriptStep, ScriptedBackend};
    use std::time::Duration;

    fn definition() -> PipelineDefinition {
        PipelineBuilder::new("ci")
            .stage("build")
            .job(JobDefinition::new("compile", "build", "rust"))
            .into_definition()
    }

    #[tokio::test]
    async fn test_start_and_wait() {
        let (publisher, stream) = event_channel(64);
        let backend = Arc::new(ScriptedBackend::new(publisher));
        let store = Arc::new(InMemoryRunStore::new());
        let sink = Arc::new(CollectingEventSink::new());
        let ctx = SchedulerContext::new(store.clone(), BackendRegistry::new().register(backend.clone()))
            .with_sink(sink.clone());
        let engine = Engine::new(ctx, stream);

        let handle = engine.start_run(definition(), "abc", Trigger::manual("dev")).await.unwrap();
        let run_id = handle.run_id();
        let run = handle.wait().await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(sink.count(names::RUN_CREATED), 1);
        assert_eq!(sink.count(names::RUN_FINISHED), 1);
        assert!(engine.active_runs().is_empty());

        let stored = engine.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_invalid_definition_is_not_recorded() {
        let (_publisher, stream) = event_channel(8);
        let store = Arc::new(InMemoryRunStore::new());
        let engine = Engine::new(SchedulerContext::new(store.clone(), BackendRegistry::new()), stream);

        let bad = PipelineDefinition::new("empty");
        let err = engine.start_run(bad, "abc", Trigger::default()).await.unwrap_err();

        assert!(matches!(err, ConveyorError::Configuration(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_run() {
        let (_publisher, stream) = event_channel(8);
        let engine = Engine::new(
            SchedulerContext::new(Arc::new(InMemoryRunStore::new()), BackendRegistry::new()),
            stream,
        );
        let err = engine.cancel_run(Uuid::now_v7(), "nope").await.unwrap_err();
        assert!(matches!(err, ConveyorError::UnknownRun(_)));
    }

    #[tokio::test]
    async fn test_cancel_unowned_run_is_recorded_then_recovered() {
        let (publisher, stream) = event_channel(8);
        let backend = Arc::new(ScriptedBackend::new(publisher).script("compile", [ScriptStep::Hang]));
        let store = Arc::new(InMemoryRunStore::new());

        let graph = DependencyGraph::from_definition(&definition());
        let run = PipelineRun::new(Uuid::now_v7(), &graph, "abc", Trigger::default(), now_utc());
        store.create(&run).await.unwrap();

        let ctx = SchedulerContext::new(store.clone(), BackendRegistry::new().register(backend.clone()))
            .with_config(SchedulerConfig::default().with_poll_interval_ms(20));
        let engine = Engine::new(ctx, stream);
        engine.cancel_run(run.id, "superseded").await.unwrap();

        let handles = engine.recover().await.unwrap();
        assert_eq!(handles.len(), 1);
        let finished = tokio::time::timeout(Duration::from_secs(5), handles.into_iter().next().unwrap().wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(finished.status, RunStatus::Canceled);
        assert_eq!(finished.cancel_reason.as_deref(), Some("superseded"));
        assert_eq!(finished.jobs["compile"].status, JobStatus::Canceled);
        assert!(backend.submitted_jobs().is_empty());
    }
}
