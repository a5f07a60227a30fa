//! Pipeline fixtures and an engine harness.

use std::sync::Arc;
use std::time::Duration;

use super::ScriptedBackend;
use crate::backend::BackendRegistry;
use crate::config::SchedulerConfig;
use crate::engine::Engine;
use crate::errors::ConveyorError;
use crate::events::{event_channel, CollectingEventSink, EventPublisher};
use crate::graph::{JobDefinition, PipelineBuilder, PipelineDefinition};
use crate::scheduler::{BackoffPolicy, JitterStrategy, SchedulerContext};
use crate::store::{InMemoryRunStore, PipelineRun, Trigger};

/// How long [`TestHarness::run`] waits for a run to finish.
pub const RUN_DEADLINE: Duration = Duration::from_secs(10);

/// A job on the default test image.
#[must_use]
pub fn job(id: &str, stage: &str) -> JobDefinition {
    JobDefinition::new(id, stage, "alpine:3.20").with_command(["sh", "-c", "true"])
}

/// One stage with two independent jobs, `a` and `b`.
#[must_use]
pub fn two_independent_jobs() -> PipelineDefinition {
    PipelineBuilder::new("independent")
        .stage("build")
        .job(job("a", "build"))
        .job(job("b", "build"))
        .into_definition()
}

/// `build` in stage one, `test` in stage two needing `build`.
#[must_use]
pub fn build_then_test() -> PipelineDefinition {
    PipelineBuilder::new("build-test")
        .stage("build")
        .stage("test")
        .job(job("build", "build"))
        .job(job("test", "test").needs("build"))
        .into_definition()
}

/// `compile` fans out to `unit` and `lint`, which both feed `package`.
#[must_use]
pub fn diamond() -> PipelineDefinition {
    PipelineBuilder::new("diamond")
        .stage("build")
        .stage("check")
        .stage("release")
        .job(job("compile", "build"))
        .job(job("unit", "check").needs("compile"))
        .job(job("lint", "check").needs("compile"))
        .job(job("package", "release").needs("unit").needs("lint"))
        .into_definition()
}

/// Scheduler settings tuned for fast tests: short poll, short unjittered backoff.
#[must_use]
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_poll_interval_ms(20)
        .with_submit_timeout_ms(1_000)
        .with_backoff(
            BackoffPolicy::default()
                .with_base_delay_ms(5)
                .with_max_delay_ms(50)
                .with_jitter(JitterStrategy::None),
        )
}

/// An engine wired to scripted backends, an in-memory store and a
/// collecting sink.
pub struct TestHarness {
    /// The engine under test.
    pub engine: Engine,
    /// The default backend.
    pub backend: Arc<ScriptedBackend>,
    /// Every registered backend, default first.
    pub backends: Vec<Arc<ScriptedBackend>>,
    /// The run store.
    pub store: Arc<InMemoryRunStore>,
    /// Lifecycle events.
    pub sink: Arc<CollectingEventSink>,
    publisher: EventPublisher,
}

impl TestHarness {
    /// Creates a harness with one backend named "local".
    #[must_use]
    pub fn new(config: SchedulerConfig, script: impl FnOnce(ScriptedBackend) -> ScriptedBackend) -> Self {
        Self::with_backends(config, |publisher| vec![Arc::new(script(ScriptedBackend::new(publisher)))])
    }

    /// Creates a harness with the backends `make` builds; the first is the default.
    ///
    /// # Panics
    ///
    /// Panics if `make` returns no backend.
    #[must_use]
    pub fn with_backends(
        config: SchedulerConfig,
        make: impl FnOnce(EventPublisher) -> Vec<Arc<ScriptedBackend>>,
    ) -> Self {
        let (publisher, stream) = event_channel(config.event_channel_capacity);
        let backends = make(publisher.clone());
        assert!(!backends.is_empty(), "harness needs at least one backend");

        let registry = backends
            .iter()
            .fold(BackendRegistry::new(), |registry, backend| registry.register(backend.clone()));
        let store = Arc::new(InMemoryRunStore::new());
        let sink = Arc::new(CollectingEventSink::new());
        let ctx = SchedulerContext::new(store.clone(), registry)
            .with_sink(sink.clone())
            .with_config(config);

        Self {
            engine: Engine::new(ctx, stream),
            backend: backends[0].clone(),
            backends,
            store,
            sink,
            publisher,
        }
    }

    /// A publisher into the engine's event stream, for injecting events.
    #[must_use]
    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    /// Starts `definition` and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns the run's error, or [`ConveyorError::Internal`] if it does not
    /// finish within [`RUN_DEADLINE`].
    pub async fn run(&self, definition: PipelineDefinition) -> Result<PipelineRun, ConveyorError> {
        let handle = self.engine.start_run(definition, "0000000", Trigger::manual("tests")).await?;
        tokio::time::timeout(RUN_DEADLINE, handle.wait())
            .await
            .map_err(|_| ConveyorError::Internal("run did not finish in time".to_string()))?
    }
}

impl std::fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHarness")
            .field("engine", &self.engine)
            .field("backends", &self.backends.len())
            .finish_non_exhaustive()
    }
}
