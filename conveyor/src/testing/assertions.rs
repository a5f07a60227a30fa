//! Assertions on run records.

use crate::core::{FailureKind, JobStatus, RunStatus};
use crate::store::PipelineRun;

/// Asserts the run finished with `expected`.
pub fn assert_run_status(run: &PipelineRun, expected: RunStatus) {
    assert_eq!(
        run.status,
        expected,
        "Expected run status {expected}, got {}. Jobs: {:?}",
        run.status,
        run.statuses()
    );
}

/// Asserts `job_id` exists and has `expected` status.
pub fn assert_job_status(run: &PipelineRun, job_id: &str, expected: JobStatus) {
    let Some(job) = run.job(job_id) else {
        panic!("Expected job '{job_id}' in run, jobs are {:?}", run.jobs.keys().collect::<Vec<_>>());
    };
    assert_eq!(
        job.status, expected,
        "Expected job '{job_id}' to be {expected}, got {} (failure: {:?})",
        job.status, job.failure
    );
}

/// Asserts the job's recorded failure has kind `expected`.
pub fn assert_failure_kind(run: &PipelineRun, job_id: &str, expected: FailureKind) {
    let failure = run.job(job_id).and_then(|j| j.failure.as_ref());
    assert_eq!(
        failure.map(|f| f.kind),
        Some(expected),
        "Expected job '{job_id}' to record a {expected} failure, got {failure:?}"
    );
}

/// Asserts every job in the run is terminal.
pub fn assert_settled(run: &PipelineRun) {
    assert!(run.is_settled(), "Expected every job terminal, got {:?}", run.statuses());
    assert!(run.finished_at.is_some(), "Expected finished_at to be set");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyGraph;
    use crate::store::Trigger;
    use crate::testing::two_independent_jobs;
    use crate::utils::now_utc;
    use uuid::Uuid;

    fn run() -> PipelineRun {
        let graph = DependencyGraph::from_definition(&two_independent_jobs());
        PipelineRun::new(Uuid::now_v7(), &graph, "abc", Trigger::default(), now_utc())
    }

    #[test]
    fn test_assert_job_status() {
        assert_job_status(&run(), "a", JobStatus::Pending);
    }

    #[test]
    #[should_panic(expected = "Expected job 'a' to be succeeded")]
    fn test_assert_job_status_fails() {
        assert_job_status(&run(), "a", JobStatus::Succeeded);
    }

    #[test]
    #[should_panic(expected = "Expected job 'missing' in run")]
    fn test_assert_missing_job() {
        assert_job_status(&run(), "missing", JobStatus::Pending);
    }

    #[test]
    fn test_assert_run_status() {
        assert_run_status(&run(), RunStatus::Pending);
    }
}
