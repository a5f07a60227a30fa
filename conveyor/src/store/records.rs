//! Durable run, stage and job records.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

use crate::backend::ExecutionHandle;
use crate::core::{JobFailure, JobStatus, RunStatus};
use crate::graph::{DependencyGraph, PipelineDefinition};
use crate::utils::Timestamp;

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Started by a person or API call.
    #[default]
    Manual,
    /// Started by an external event such as a push.
    Event,
}

/// Origin of a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Trigger {
    /// Trigger category.
    pub kind: TriggerKind,
    /// Who started the run.
    #[serde(default)]
    pub actor: Option<String>,
    /// Event source, for event triggers.
    #[serde(default)]
    pub source: Option<String>,
}

impl Trigger {
    /// A manual trigger by `actor`.
    #[must_use]
    pub fn manual(actor: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Manual,
            actor: Some(actor.into()),
            source: None,
        }
    }

    /// An event trigger from `source`.
    #[must_use]
    pub fn event(source: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Event,
            actor: None,
            source: Some(source.into()),
        }
    }
}

/// State of one job within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    /// Job id.
    pub job_id: String,
    /// Owning stage.
    pub stage: String,
    /// Jobs that must succeed first.
    pub dependencies: Vec<String>,
    /// Current status.
    pub status: JobStatus,
    /// Attempts claimed so far, counting the current one.
    pub attempt_count: u32,
    /// Retries left after the current attempt.
    pub retries_remaining: u32,
    /// Backend the current attempt was claimed for.
    pub backend: Option<String>,
    /// Backend reference of the current attempt.
    pub handle: Option<ExecutionHandle>,
    /// Exit code of the last finished attempt.
    pub exit_code: Option<i32>,
    /// Last recorded failure.
    pub failure: Option<JobFailure>,
    /// Record creation time.
    pub created_at: Timestamp,
    /// Claim time of the current attempt.
    pub dispatched_at: Option<Timestamp>,
    /// Start time of the current attempt.
    pub started_at: Option<Timestamp>,
    /// When the job became terminal.
    pub finished_at: Option<Timestamp>,
    /// When a Retrying job may return to Pending.
    pub retry_at: Option<Timestamp>,
    /// Highest event sequence applied for the current attempt.
    pub last_sequence: Option<u64>,
    /// Idempotency keys of every applied event.
    #[serde(default)]
    pub applied_keys: BTreeSet<String>,
}

impl JobRun {
    fn new(job_id: &str, stage: &str, dependencies: Vec<String>, retries: u32, now: Timestamp) -> Self {
        Self {
            job_id: job_id.to_string(),
            stage: stage.to_string(),
            dependencies,
            status: JobStatus::Pending,
            attempt_count: 0,
            retries_remaining: retries,
            backend: None,
            handle: None,
            exit_code: None,
            failure: None,
            created_at: now,
            dispatched_at: None,
            started_at: None,
            finished_at: None,
            retry_at: None,
            last_sequence: None,
            applied_keys: BTreeSet::new(),
        }
    }
}

/// Derived state of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRun {
    /// Stage name.
    pub name: String,
    /// Position in the pipeline.
    pub ordinal: usize,
    /// Status derived from the contained jobs.
    pub status: RunStatus,
    /// Contained job ids.
    pub jobs: Vec<String>,
    /// When the first job left Pending.
    pub started_at: Option<Timestamp>,
    /// When the stage became terminal.
    pub finished_at: Option<Timestamp>,
}

/// One execution of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run id.
    pub id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// Source revision being built.
    pub revision: String,
    /// What started the run.
    pub trigger: Trigger,
    /// Derived run status.
    pub status: RunStatus,
    /// Compare-and-set counter, bumped by every saved delta.
    pub version: u64,
    /// Creation time.
    pub created_at: Timestamp,
    /// When scheduling began.
    pub started_at: Option<Timestamp>,
    /// When every job became terminal.
    pub finished_at: Option<Timestamp>,
    /// Set once cancellation is requested.
    pub cancel_reason: Option<String>,
    /// Definition the run was started from.
    pub definition: PipelineDefinition,
    /// Stage records in pipeline order.
    pub stages: Vec<StageRun>,
    /// Job records keyed by id.
    pub jobs: BTreeMap<String, JobRun>,
}

/// Derives a stage status from its jobs' statuses.
#[must_use]
pub fn derive_stage_status<'a>(statuses: impl IntoIterator<Item = &'a JobStatus>) -> RunStatus {
    let statuses: Vec<&JobStatus> = statuses.into_iter().collect();
    if statuses.iter().any(|s| **s == JobStatus::Failed) {
        RunStatus::Failed
    } else if statuses.iter().all(|s| **s == JobStatus::Succeeded) {
        RunStatus::Succeeded
    } else if statuses.iter().all(|s| s.is_unstarted()) {
        RunStatus::Pending
    } else if statuses.iter().all(|s| s.is_terminal()) {
        RunStatus::Canceled
    } else {
        RunStatus::Running
    }
}

impl PipelineRun {
    /// Creates a pending run of `graph`.
    #[must_use]
    pub fn new(id: Uuid, graph: &DependencyGraph, revision: impl Into<String>, trigger: Trigger, now: Timestamp) -> Self {
        let jobs = graph
            .nodes()
            .map(|node| {
                let run = JobRun::new(
                    &node.id,
                    &node.stage,
                    node.dependencies.iter().cloned().collect(),
                    node.execution.retries,
                    now,
                );
                (node.id.clone(), run)
            })
            .collect();

        let stages = graph
            .stages()
            .iter()
            .map(|stage| StageRun {
                name: stage.name.clone(),
                ordinal: stage.ordinal,
                status: RunStatus::Pending,
                jobs: stage.jobs.clone(),
                started_at: None,
                finished_at: None,
            })
            .collect();

        Self {
            id,
            pipeline: graph.name().to_string(),
            revision: revision.into(),
            trigger,
            status: RunStatus::Pending,
            version: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
            cancel_reason: None,
            definition: graph.definition().clone(),
            stages,
            jobs,
        }
    }

    /// Returns every job's status keyed by job id.
    #[must_use]
    pub fn statuses(&self) -> HashMap<String, JobStatus> {
        self.jobs.iter().map(|(id, job)| (id.clone(), job.status)).collect()
    }

    /// Returns a job record.
    #[must_use]
    pub fn job(&self, id: &str) -> Option<&JobRun> {
        self.jobs.get(id)
    }

    /// Returns true once every job is terminal.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.jobs.values().all(|j| j.status.is_terminal())
    }

    /// Returns true until the run has finished.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.finished_at.is_none()
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.cancel_reason.is_some()
    }

    /// Recomputes stage and run status from job statuses.
    pub fn refresh(&mut self, now: Timestamp) {
        for stage in &mut self.stages {
            let status = derive_stage_status(
                stage
                    .jobs
                    .iter()
                    .filter_map(|id| self.jobs.get(id))
                    .map(|j| &j.status),
            );
            if status != RunStatus::Pending && stage.started_at.is_none() {
                stage.started_at = Some(now);
            }
            if status.is_terminal() && stage.finished_at.is_none() {
                stage.finished_at = Some(now);
            }
            stage.status = status;
        }

        // A failed stage keeps the run Failed even if a cancel follows.
        self.status = if self.stages.iter().any(|s| s.status == RunStatus::Failed) {
            RunStatus::Failed
        } else if self.cancel_requested() {
            RunStatus::Canceled
        } else if self.stages.iter().all(|s| s.status == RunStatus::Succeeded) {
            RunStatus::Succeeded
        } else if self.stages.iter().all(|s| s.status.is_terminal()) {
            RunStatus::Canceled
        } else if self.started_at.is_some() {
            RunStatus::Running
        } else {
            RunStatus::Pending
        };

        if self.is_settled() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
    }
}
