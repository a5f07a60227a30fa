//! Per-run scheduling.
//!
//! [`SchedulerCore`] owns one run. Each turn of its loop promotes due
//! retries, turns expired attempts into timeout failures, computes the ready
//! set, hands ready jobs to the [`Dispatcher`], and feeds execution events
//! through the [`EventReconciler`]. Every transition is persisted through the
//! run store before any side effect depending on it happens.

mod budget;
mod dispatcher;
mod reconciler;
mod retry;
mod run_loop;

#[cfg(test)]
mod integration_tests;

pub use budget::ConcurrencyBudget;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use reconciler::{CancelOrder, EventReconciler, Propagation, Reconciled, Reconciliation};
pub use retry::{BackoffPolicy, BackoffStrategy, JitterStrategy};
pub use run_loop::SchedulerCore;

use std::sync::Arc;

use crate::backend::BackendRegistry;
use crate::config::{SchedulerConfig, Settings};
use crate::errors::{SettingsError, StoreError};
use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
use crate::store::{self, PipelineRun, RunDelta, RunStateStore, RunTransaction};

/// Collaborators shared by every run of an engine.
#[derive(Clone)]
pub struct SchedulerContext {
    /// Durable run state.
    pub store: Arc<dyn RunStateStore>,
    /// Available execution backends.
    pub backends: BackendRegistry,
    /// Lifecycle event sink.
    pub sink: Arc<dyn EventSink>,
    /// Scheduling tunables.
    pub config: SchedulerConfig,
}

impl SchedulerContext {
    /// Creates a context with a no-op sink and default config.
    #[must_use]
    pub fn new(store: Arc<dyn RunStateStore>, backends: BackendRegistry) -> Self {
        Self {
            store,
            backends,
            sink: Arc::new(NoOpEventSink),
            config: SchedulerConfig::default(),
        }
    }

    /// Builds a context from loaded settings, logging lifecycle events.
    ///
    /// # Errors
    ///
    /// Returns a [`SettingsError`] if the settings are invalid or the
    /// configured store cannot be opened.
    pub fn from_settings(settings: &Settings, backends: BackendRegistry) -> Result<Self, SettingsError> {
        settings.validate()?;
        let store = store::open(&settings.store)?;
        Ok(Self::new(store, backends)
            .with_sink(Arc::new(LoggingEventSink::default()))
            .with_config(settings.scheduler.clone()))
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the scheduler config.
    #[must_use]
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }
}

impl std::fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerContext")
            .field("backends", &self.backends)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Commits `tx` against `run` and saves the delta, if any.
pub(crate) async fn persist(
    store: &dyn RunStateStore,
    tx: RunTransaction,
    run: &mut PipelineRun,
) -> Result<Option<RunDelta>, StoreError> {
    let Some(delta) = tx.commit(run) else {
        return Ok(None);
    };
    store.save(&delta).await?;
    Ok(Some(delta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreKind, StoreSettings};

    #[test]
    fn test_context_from_settings() {
        let settings = Settings::from_json(r#"{"scheduler": {"max_parallel_jobs": 2}}"#).unwrap();
        let ctx = SchedulerContext::from_settings(&settings, BackendRegistry::new()).unwrap();
        assert_eq!(ctx.config.max_parallel_jobs, 2);
    }

    #[test]
    fn test_context_from_settings_rejects_pathless_file_store() {
        let settings = Settings {
            store: StoreSettings {
                kind: StoreKind::File,
                path: None,
            },
            ..Settings::default()
        };
        assert!(SchedulerContext::from_settings(&settings, BackendRegistry::new()).is_err());
    }
}
