//! Pipeline definitions and the dependency graph derived from them.
//!
//! A [`PipelineDefinition`] is the parsed input. [`DependencyGraph`] resolves
//! it into explicit and stage-barrier edges, validates it, and answers which
//! jobs are ready to run for a given set of job statuses.

mod builder;
mod dag;
mod spec;

pub use builder::PipelineBuilder;
pub use dag::{DependencyGraph, JobNode, ReadySet, StageNode};
pub use spec::{JobDefinition, JobExecutionSpec, PipelineDefinition, ResourceRequests, StageDefinition};
