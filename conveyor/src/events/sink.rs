//! Lifecycle event sinks.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, Level};

/// Event type names emitted by the scheduler.
pub mod names {
    /// A run was created and persisted.
    pub const RUN_CREATED: &str = "run.created";
    /// A run began scheduling.
    pub const RUN_STARTED: &str = "run.started";
    /// A run settled.
    pub const RUN_FINISHED: &str = "run.finished";
    /// Cancellation of a run was requested.
    pub const RUN_CANCEL_REQUESTED: &str = "run.cancel_requested";
    /// A job was handed to a backend.
    pub const JOB_SUBMITTED: &str = "job.submitted";
    /// A backend refused a job.
    pub const JOB_REJECTED: &str = "job.rejected";
    /// A job changed status because of an execution event.
    pub const JOB_TRANSITION: &str = "job.transition";
    /// A failed job was scheduled for another attempt.
    pub const JOB_RETRY_SCHEDULED: &str = "job.retry_scheduled";
    /// A job was canceled by the scheduler.
    pub const JOB_CANCELED: &str = "job.canceled";
    /// An event was dropped as a duplicate.
    pub const EVENT_DUPLICATE: &str = "event.duplicate";
    /// An event was dropped as stale.
    pub const EVENT_STALE: &str = "event.stale";
    /// An event arrived for a run that is not active.
    pub const EVENT_UNKNOWN_RUN: &str = "event.unknown_run";
}

/// Receives scheduler lifecycle events.
///
/// Sinks observe the scheduler; they never influence it. Implementations
/// must not panic and should not block.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    ///
    /// * `event_type` - Dotted event name, see [`names`]
    /// * `data` - Optional structured payload
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Emits an event without awaiting. Failures are swallowed.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level`. Anything other than DEBUG logs at INFO.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// A debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event_type: &str, data: Option<&Value>) {
        if self.level == Level::DEBUG {
            debug!(event_type = %event_type, event_data = ?data, "scheduler event");
        } else {
            info!(event_type = %event_type, event_data = ?data, "scheduler event");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// Records events in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every recorded event.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    /// Returns the number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns the payloads of events named exactly `event_type`.
    #[must_use]
    pub fn payloads(&self, event_type: &str) -> Vec<Value> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t == event_type)
            .map(|(_, d)| d.clone().unwrap_or(Value::Null))
            .collect()
    }

    /// Counts events named exactly `event_type`.
    #[must_use]
    pub fn count(&self, event_type: &str) -> usize {
        self.events.read().iter().filter(|(t, _)| t == event_type).count()
    }

    /// Returns events whose type starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}
