//! Pipeline, stage and job definitions handed to the engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resources a job asks its backend for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequests {
    /// CPU in thousandths of a core.
    #[serde(default)]
    pub cpu_millis: Option<u32>,
    /// Memory in mebibytes.
    #[serde(default)]
    pub memory_mb: Option<u32>,
}

/// How and where a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecutionSpec {
    /// Container image reference.
    pub image: String,
    /// Command and arguments run inside the image.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Resource requests.
    #[serde(default)]
    pub resources: ResourceRequests,
    /// How many times a failed attempt is retried.
    #[serde(default)]
    pub retries: u32,
    /// Maximum duration of one attempt.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Registered backend name; the registry default when unset.
    #[serde(default)]
    pub backend: Option<String>,
}

impl JobExecutionSpec {
    /// Creates a spec running `image` with its default command.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            resources: ResourceRequests::default(),
            retries: 0,
            timeout_secs: None,
            backend: None,
        }
    }
}

/// One job declared in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique job id.
    pub id: String,
    /// Name of the stage the job belongs to.
    pub stage: String,
    /// Jobs that must succeed first, beyond the previous stage.
    #[serde(default)]
    pub needs: Vec<String>,
    /// Execution details.
    pub execution: JobExecutionSpec,
}

impl JobDefinition {
    /// Creates a job in `stage` running `image`.
    #[must_use]
    pub fn new(id: impl Into<String>, stage: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stage: stage.into(),
            needs: Vec::new(),
            execution: JobExecutionSpec::new(image),
        }
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn needs(mut self, job: impl Into<String>) -> Self {
        self.needs.push(job.into());
        self
    }

    /// Sets the command.
    #[must_use]
    pub fn with_command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.execution.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.execution.env.insert(key.into(), value.into());
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.execution.retries = retries;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.execution.timeout_secs = Some(secs);
        self
    }

    /// Pins the job to a registered backend.
    #[must_use]
    pub fn on_backend(mut self, backend: impl Into<String>) -> Self {
        self.execution.backend = Some(backend.into());
        self
    }

    /// Sets the resource requests.
    #[must_use]
    pub fn with_resources(mut self, cpu_millis: Option<u32>, memory_mb: Option<u32>) -> Self {
        self.execution.resources = ResourceRequests {
            cpu_millis,
            memory_mb,
        };
        self
    }
}

/// One stage declared in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage name.
    pub name: String,
    /// Whether sibling jobs keep running after one of them fails.
    ///
    /// `None` defers to the scheduler-wide default.
    #[serde(default)]
    pub continue_on_failure: Option<bool>,
}

impl StageDefinition {
    /// Creates a stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            continue_on_failure: None,
        }
    }

    /// Sets the continue-on-failure policy for this stage.
    #[must_use]
    pub fn continue_on_failure(mut self, enabled: bool) -> Self {
        self.continue_on_failure = Some(enabled);
        self
    }
}

/// A parsed pipeline: ordered stages and jobs in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// The pipeline name.
    pub name: String,
    /// Stages in execution order.
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
    /// Jobs in declaration order.
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

impl PipelineDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            jobs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_definition_builder() {
        let job = JobDefinition::new("test", "verify", "rust:1.80")
            .needs("compile")
            .with_command(["cargo", "test"])
            .with_env("RUST_LOG", "debug")
            .with_retries(2)
            .with_timeout_secs(600)
            .on_backend("cluster");

        assert_eq!(job.needs, vec!["compile".to_string()]);
        assert_eq!(job.execution.command, vec!["cargo", "test"]);
        assert_eq!(job.execution.retries, 2);
        assert_eq!(job.execution.timeout_secs, Some(600));
        assert_eq!(job.execution.backend.as_deref(), Some("cluster"));
    }

    #[test]
    fn test_definition_deserialize_defaults() {
        let json = serde_json::json!({
            "name": "ci",
            "stages": [{"name": "build"}],
            "jobs": [{"id": "compile", "stage": "build", "execution": {"image": "rust:1.80"}}],
        });
        let def: PipelineDefinition = serde_json::from_value(json).unwrap();

        assert_eq!(def.stages[0].continue_on_failure, None);
        assert!(def.jobs[0].needs.is_empty());
        assert_eq!(def.jobs[0].execution.retries, 0);
        assert!(def.jobs[0].execution.backend.is_none());
    }
}
