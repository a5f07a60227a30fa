//! # Conveyor
//!
//! A pipeline scheduling and execution engine for build, test and deploy runs.
//!
//! Conveyor turns a declarative pipeline definition into a validated
//! dependency graph, dispatches jobs to execution backends as their
//! dependencies finish, and reconciles asynchronous status reports into
//! durable run state:
//!
//! - **Stage-ordered DAGs**: jobs depend on earlier stages and on explicit `needs`
//! - **Bounded dispatch**: a per-run concurrency budget with per-backend limits
//! - **Idempotent reconciliation**: duplicate and stale events are dropped
//! - **Retries with backoff**: exponential, linear or constant, with jitter
//! - **Durable state**: every transition is persisted before it is acted on
//! - **Recovery**: active runs resume from the store after a restart
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conveyor::prelude::*;
//! use std::sync::Arc;
//!
//! let (publisher, stream) = event_channel(1024);
//! let backends = BackendRegistry::new()
//!     .register(Arc::new(ContainerBackend::docker(publisher)));
//! let ctx = SchedulerContext::new(Arc::new(InMemoryRunStore::new()), backends);
//! let engine = Engine::new(ctx, stream);
//!
//! let definition = PipelineBuilder::new("ci")
//!     .stage("build")
//!     .stage("test")
//!     .job(JobDefinition::new("compile", "build", "rust:1.80").with_command(["cargo", "build"]))
//!     .job(JobDefinition::new("unit", "test", "rust:1.80").needs("compile"))
//!     .into_definition();
//!
//! let run = engine.start_run(definition, "3f2a9c1", Trigger::manual("dev")).await?.wait().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backend;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod graph;
pub mod observability;
pub mod scheduler;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    #[cfg(feature = "cluster")]
    pub use crate::backend::cluster::{ClusterBackend, PodClient};
    #[cfg(feature = "container")]
    pub use crate::backend::container::ContainerBackend;
    pub use crate::backend::{BackendRegistry, ExecutionBackend, ExecutionHandle, JobSubmission};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{LogFormat, SchedulerConfig, Settings, StoreKind, StoreSettings};
    pub use crate::core::{
        ExecutionEvent, FailureKind, JobFailure, JobStatus, ReportedStatus, RunStatus,
    };
    pub use crate::engine::{Engine, RunHandle};
    pub use crate::errors::{
        ConfigurationError, ConfigurationErrorKind, ConveyorError, StoreError, SubmitError,
    };
    pub use crate::events::{
        event_channel, EventPublisher, EventSink, EventStream, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::graph::{
        DependencyGraph, JobDefinition, PipelineBuilder, PipelineDefinition, StageDefinition,
    };
    pub use crate::observability::init_tracing;
    pub use crate::scheduler::{BackoffPolicy, BackoffStrategy, JitterStrategy, SchedulerContext};
    pub use crate::store::{
        FileRunStore, InMemoryRunStore, PipelineRun, RunStateStore, Trigger,
    };
    pub use crate::utils::{generate_run_id, Timestamp};
}
