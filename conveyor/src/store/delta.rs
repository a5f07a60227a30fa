//! Versioned, compare-and-set deltas between run record states.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{JobRun, PipelineRun, StageRun};
use crate::core::{JobStatus, RunStatus};
use crate::errors::StoreError;
use crate::utils::Timestamp;

/// A changed job and the status it must still have in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobChange {
    /// Status the job had when the transaction began.
    pub expected: JobStatus,
    /// The job's new record.
    pub job: JobRun,
}

/// An atomic update to one run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDelta {
    /// Run being updated.
    pub run_id: Uuid,
    /// Record version the delta was computed against.
    pub base_version: u64,
    /// New run status.
    pub status: RunStatus,
    /// New start time.
    pub started_at: Option<Timestamp>,
    /// New finish time.
    pub finished_at: Option<Timestamp>,
    /// New cancel reason.
    pub cancel_reason: Option<String>,
    /// Every stage record, recomputed.
    pub stages: Vec<StageRun>,
    /// Changed jobs.
    pub jobs: Vec<JobChange>,
}

impl RunDelta {
    /// Version the record holds once the delta is applied.
    #[must_use]
    pub fn next_version(&self) -> u64 {
        self.base_version + 1
    }

    /// Returns the change for `job_id`, if the delta touches it.
    #[must_use]
    pub fn job(&self, job_id: &str) -> Option<&JobChange> {
        self.jobs.iter().find(|c| c.job.job_id == job_id)
    }
}

/// Snapshot of a run taken before mutating it.
///
/// ```
/// # use conveyor::store::RunTransaction;
/// # fn demo(run: &mut conveyor::store::PipelineRun) {
/// let tx = RunTransaction::begin(run);
/// run.cancel_reason = Some("superseded".to_string());
/// let delta = tx.commit(run);
/// assert!(delta.is_some());
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RunTransaction {
    base_version: u64,
    status: RunStatus,
    started_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
    cancel_reason: Option<String>,
    stages: Vec<StageRun>,
    jobs: BTreeMap<String, JobRun>,
}

impl RunTransaction {
    /// Snapshots `run`.
    #[must_use]
    pub fn begin(run: &PipelineRun) -> Self {
        Self {
            base_version: run.version,
            status: run.status,
            started_at: run.started_at,
            finished_at: run.finished_at,
            cancel_reason: run.cancel_reason.clone(),
            stages: run.stages.clone(),
            jobs: run.jobs.clone(),
        }
    }

    /// Diffs `run` against the snapshot.
    ///
    /// Returns `None` when nothing changed. Otherwise bumps `run.version`
    /// and returns the delta to persist.
    pub fn commit(self, run: &mut PipelineRun) -> Option<RunDelta> {
        let jobs: Vec<JobChange> = run
            .jobs
            .iter()
            .filter_map(|(id, job)| match self.jobs.get(id) {
                Some(before) if before == job => None,
                Some(before) => Some(JobChange {
                    expected: before.status,
                    job: job.clone(),
                }),
                None => Some(JobChange {
                    expected: job.status,
                    job: job.clone(),
                }),
            })
            .collect();

        let header_changed = self.status != run.status
            || self.started_at != run.started_at
            || self.finished_at != run.finished_at
            || self.cancel_reason != run.cancel_reason
            || self.stages != run.stages;

        if jobs.is_empty() && !header_changed {
            return None;
        }

        run.version = self.base_version + 1;
        Some(RunDelta {
            run_id: run.id,
            base_version: self.base_version,
            status: run.status,
            started_at: run.started_at,
            finished_at: run.finished_at,
            cancel_reason: run.cancel_reason.clone(),
            stages: run.stages.clone(),
            jobs,
        })
    }
}

/// Applies `delta` to a stored record after checking its preconditions.
///
/// # Errors
///
/// Returns [`StoreError::Conflict`] if the record version moved or a changed
/// job no longer has its expected status. The record is untouched on error.
pub fn apply_delta(record: &mut PipelineRun, delta: &RunDelta) -> Result<(), StoreError> {
    if record.version != delta.base_version {
        return Err(StoreError::Conflict {
            run_id: record.id,
            detail: format!(
                "record is at version {}, delta expects {}",
                record.version, delta.base_version
            ),
        });
    }

    for change in &delta.jobs {
        let id = &change.job.job_id;
        let current = record.jobs.get(id).map(|j| j.status).ok_or_else(|| StoreError::Conflict {
            run_id: record.id,
            detail: format!("job '{id}' is not part of the run"),
        })?;
        if current != change.expected {
            return Err(StoreError::Conflict {
                run_id: record.id,
                detail: format!("job '{id}' is {current}, expected {}", change.expected),
            });
        }
    }

    record.version = delta.next_version();
    record.status = delta.status;
    record.started_at = delta.started_at;
    record.finished_at = delta.finished_at;
    record.cancel_reason.clone_from(&delta.cancel_reason);
    record.stages.clone_from(&delta.stages);
    for change in &delta.jobs {
        record.jobs.insert(change.job.job_id.clone(), change.job.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{JobDefinition, PipelineBuilder};
    use crate::store::Trigger;
    use crate::utils::now_utc;

    fn run() -> PipelineRun {
        let graph = PipelineBuilder::new("ci")
            .stage("build")
            .job(JobDefinition::new("a", "build", "alpine"))
            .job(JobDefinition::new("b", "build", "alpine"))
            .build()
            .unwrap();
        PipelineRun::new(Uuid::now_v7(), &graph, "rev", Trigger::default(), now_utc())
    }

    #[test]
    fn test_commit_without_changes() {
        let mut working = run();
        let tx = RunTransaction::begin(&working);
        assert!(tx.commit(&mut working).is_none());
        assert_eq!(working.version, 0);
    }

    #[test]
    fn test_commit_collects_changed_jobs() {
        let mut working = run();
        let tx = RunTransaction::begin(&working);
        working.jobs.get_mut("a").unwrap().status = JobStatus::Ready;

        let delta = tx.commit(&mut working).unwrap();
        assert_eq!(delta.base_version, 0);
        assert_eq!(working.version, 1);
        assert_eq!(delta.jobs.len(), 1);
        assert_eq!(delta.job("a").unwrap().expected, JobStatus::Pending);
    }

    #[test]
    fn test_apply_checks_version() {
        let mut stored = run();
        let mut working = stored.clone();

        let tx = RunTransaction::begin(&working);
        working.jobs.get_mut("a").unwrap().status = JobStatus::Ready;
        let delta = tx.commit(&mut working).unwrap();

        apply_delta(&mut stored, &delta).unwrap();
        assert_eq!(stored, working);

        // Replaying the same delta is a version conflict.
        let err = apply_delta(&mut stored, &delta).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_apply_checks_expected_status() {
        let mut stored = run();
        let mut working = stored.clone();
        stored.jobs.get_mut("a").unwrap().status = JobStatus::Dispatched;

        let tx = RunTransaction::begin(&working);
        working.jobs.get_mut("a").unwrap().status = JobStatus::Dispatched;
        let delta = tx.commit(&mut working).unwrap();

        let before = stored.clone();
        assert!(apply_delta(&mut stored, &delta).unwrap_err().is_conflict());
        assert_eq!(stored, before);
    }
}
