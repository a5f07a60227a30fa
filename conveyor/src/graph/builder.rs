//! Fluent construction of validated pipelines.

use super::{DependencyGraph, JobDefinition, PipelineDefinition, StageDefinition};
use crate::errors::ConfigurationError;

/// Builder for pipeline definitions.
///
/// ```
/// use conveyor::graph::{JobDefinition, PipelineBuilder};
///
/// let graph = PipelineBuilder::new("ci")
///     .stage("build")
///     .stage("test")
///     .job(JobDefinition::new("compile", "build", "rust:1.80"))
///     .job(JobDefinition::new("unit", "test", "rust:1.80"))
///     .build()
///     .unwrap();
///
/// assert_eq!(graph.job_count(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    definition: PipelineDefinition,
}

impl PipelineBuilder {
    /// Creates a builder for a pipeline named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            definition: PipelineDefinition::new(name),
        }
    }

    /// Appends a stage with default policy.
    #[must_use]
    pub fn stage(self, name: impl Into<String>) -> Self {
        self.stage_def(StageDefinition::new(name))
    }

    /// Appends a stage definition.
    #[must_use]
    pub fn stage_def(mut self, stage: StageDefinition) -> Self {
        self.definition.stages.push(stage);
        self
    }

    /// Appends a job.
    #[must_use]
    pub fn job(mut self, job: JobDefinition) -> Self {
        self.definition.jobs.push(job);
        self
    }

    /// Returns the definition built so far.
    #[must_use]
    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Returns the unvalidated definition.
    #[must_use]
    pub fn into_definition(self) -> PipelineDefinition {
        self.definition
    }

    /// Validates and builds the dependency graph.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigurationError`] found.
    pub fn build(self) -> Result<DependencyGraph, ConfigurationError> {
        let graph = DependencyGraph::from_definition(&self.definition);
        graph.validate()?;
        Ok(graph)
    }
}
