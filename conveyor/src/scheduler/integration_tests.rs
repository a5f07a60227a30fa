//! End-to-end scheduling tests against the scripted backend.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::backend::BackendRegistry;
use crate::core::{ExecutionEvent, FailureKind, JobStatus, RunStatus};
use crate::engine::Engine;
use crate::errors::{ConfigurationErrorKind, ConveyorError, StoreError};
use crate::events::{event_channel, names};
use crate::graph::{DependencyGraph, PipelineBuilder, StageDefinition};
use crate::scheduler::SchedulerContext;
use crate::store::{MockRunStateStore, PipelineRun, RunStateStore, Trigger};
use crate::testing::{
    assert_failure_kind, assert_job_status, assert_run_status, assert_settled, build_then_test, diamond,
    fast_config, job, two_independent_jobs, ScriptStep, ScriptedBackend, TestHarness,
};
use crate::utils::now_utc;

/// Polls until `check` holds, for at most two seconds.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_independent_jobs_succeed() {
    let harness = TestHarness::new(fast_config(), |b| b);
    let run = harness.run(two_independent_jobs()).await.unwrap();

    assert_run_status(&run, RunStatus::Succeeded);
    assert_job_status(&run, "a", JobStatus::Succeeded);
    assert_job_status(&run, "b", JobStatus::Succeeded);
    assert_settled(&run);
    assert_eq!(harness.backend.submitted_jobs(), vec!["a", "b"]);
    assert_eq!(run.jobs["a"].exit_code, Some(0));
    assert_eq!(harness.sink.count(names::JOB_SUBMITTED), 2);
}

#[tokio::test]
async fn test_failed_dependency_cancels_downstream_stage() {
    let harness = TestHarness::new(fast_config(), |b| b.script("build", [ScriptStep::Fail { exit_code: 1 }]));
    let run = harness.run(build_then_test()).await.unwrap();

    assert_run_status(&run, RunStatus::Failed);
    assert_job_status(&run, "build", JobStatus::Failed);
    assert_job_status(&run, "test", JobStatus::Canceled);
    assert_failure_kind(&run, "build", FailureKind::Execution);
    assert_eq!(run.jobs["build"].exit_code, Some(1));
    assert_eq!(harness.backend.submitted_jobs(), vec!["build"]);
    assert_eq!(run.stages[1].status, RunStatus::Canceled);
}

#[tokio::test]
async fn test_retries_until_success() {
    let definition = PipelineBuilder::new("flaky")
        .stage("build")
        .job(job("flaky", "build").with_retries(2))
        .into_definition();
    let harness = TestHarness::new(fast_config(), |b| {
        b.script("flaky", [ScriptStep::Fail { exit_code: 1 }, ScriptStep::Fail { exit_code: 1 }])
    });

    let run = harness.run(definition).await.unwrap();

    assert_run_status(&run, RunStatus::Succeeded);
    assert_eq!(run.jobs["flaky"].attempt_count, 3);
    assert_eq!(run.jobs["flaky"].retries_remaining, 0);
    assert_eq!(harness.backend.attempts_of("flaky"), 3);
    assert_eq!(harness.sink.count(names::JOB_RETRY_SCHEDULED), 2);

    let attempts: Vec<u32> = harness.backend.submissions().iter().map(|s| s.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_retries_with_attemptless_events() {
    let definition = PipelineBuilder::new("flaky")
        .stage("build")
        .job(job("flaky", "build").with_retries(1))
        .into_definition();
    let harness = TestHarness::new(fast_config(), |b| {
        b.with_bare_events().script("flaky", [ScriptStep::Fail { exit_code: 1 }])
    });

    let run = harness.run(definition).await.unwrap();

    assert_run_status(&run, RunStatus::Succeeded);
    assert_eq!(run.jobs["flaky"].attempt_count, 2);
    assert_eq!(harness.backend.attempts_of("flaky"), 2);
    assert_eq!(harness.sink.count(names::EVENT_DUPLICATE), 0);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let definition = PipelineBuilder::new("flaky")
        .stage("build")
        .job(job("flaky", "build").with_retries(1))
        .into_definition();
    let harness = TestHarness::new(fast_config(), |b| {
        b.script("flaky", [ScriptStep::Fail { exit_code: 2 }, ScriptStep::Fail { exit_code: 3 }])
    });

    let run = harness.run(definition).await.unwrap();

    assert_run_status(&run, RunStatus::Failed);
    let failure = run.jobs["flaky"].failure.clone().unwrap();
    assert_eq!(failure.attempt, 2);
    assert_eq!(failure.exit_code, Some(3));
}

#[tokio::test]
async fn test_redelivered_events_are_applied_once() {
    let harness = TestHarness::new(fast_config(), ScriptedBackend::with_redelivery);
    let run = harness.run(build_then_test()).await.unwrap();

    assert_run_status(&run, RunStatus::Succeeded);
    // Running and Succeeded for each job, nothing more.
    assert_eq!(harness.sink.count(names::JOB_TRANSITION), 4);
    assert!(harness.sink.count(names::EVENT_DUPLICATE) >= 1);
    assert_eq!(harness.backend.attempts_of("build"), 1);
}

#[tokio::test]
async fn test_budget_of_one_runs_in_declared_order() {
    let definition = PipelineBuilder::new("serial")
        .stage("build")
        .job(job("first", "build"))
        .job(job("second", "build"))
        .job(job("third", "build"))
        .into_definition();
    let harness = TestHarness::new(fast_config().with_max_parallel_jobs(1), |b| b);

    let run = harness.run(definition).await.unwrap();

    assert_run_status(&run, RunStatus::Succeeded);
    assert_eq!(harness.backend.submitted_jobs(), vec!["first", "second", "third"]);
    assert_eq!(harness.backend.max_in_flight(), 1);

    let first = &run.jobs["first"];
    let second = &run.jobs["second"];
    assert!(second.dispatched_at.unwrap() >= first.finished_at.unwrap());
}

#[tokio::test]
async fn test_dispatch_order_is_deterministic() {
    let definition = diamond();
    let graph = DependencyGraph::from_definition(&definition);
    let expected: Vec<String> = graph.dispatch_order().map(str::to_string).collect();

    for _ in 0..3 {
        let harness = TestHarness::new(fast_config().with_max_parallel_jobs(1), |b| b);
        harness.run(definition.clone()).await.unwrap();
        assert_eq!(harness.backend.submitted_jobs(), expected);
    }
}

#[tokio::test]
async fn test_failure_cancels_every_transitive_dependent() {
    let harness = TestHarness::new(fast_config(), |b| b.script("compile", [ScriptStep::Fail { exit_code: 101 }]));
    let run = harness.run(diamond()).await.unwrap();

    assert_run_status(&run, RunStatus::Failed);
    for id in ["unit", "lint", "package"] {
        assert_job_status(&run, id, JobStatus::Canceled);
        assert_failure_kind(&run, id, FailureKind::Canceled);
    }
    assert_eq!(harness.backend.submitted_jobs(), vec!["compile"]);
}

#[tokio::test]
async fn test_failure_cancels_running_siblings() {
    let harness = TestHarness::new(fast_config(), |b| {
        b.script("unit", [ScriptStep::Fail { exit_code: 1 }]).script("lint", [ScriptStep::Hang])
    });
    let run = harness.run(diamond()).await.unwrap();

    assert_run_status(&run, RunStatus::Failed);
    assert_job_status(&run, "unit", JobStatus::Failed);
    assert_job_status(&run, "lint", JobStatus::Canceled);
    assert_job_status(&run, "package", JobStatus::Canceled);

    let canceled: Vec<String> = harness.backend.cancellations().iter().map(|h| h.to_string()).collect();
    assert_eq!(canceled.len(), 1);
    assert!(canceled[0].contains("lint"));
}

#[tokio::test]
async fn test_stage_can_continue_on_failure() {
    let definition = PipelineBuilder::new("tolerant")
        .stage("build")
        .stage_def(StageDefinition::new("check").continue_on_failure(true))
        .stage("release")
        .job(job("compile", "build"))
        .job(job("unit", "check").needs("compile"))
        .job(job("lint", "check").needs("compile"))
        .job(job("package", "release").needs("unit").needs("lint"))
        .into_definition();
    let harness = TestHarness::new(fast_config(), |b| {
        b.script("unit", [ScriptStep::Fail { exit_code: 1 }])
            .script("lint", [ScriptStep::SucceedAfter(Duration::from_millis(150))])
    });

    let run = harness.run(definition).await.unwrap();

    assert_run_status(&run, RunStatus::Failed);
    assert_job_status(&run, "lint", JobStatus::Succeeded);
    assert_job_status(&run, "package", JobStatus::Canceled);
    assert!(harness.backend.cancellations().is_empty());
}

#[tokio::test]
async fn test_scheduler_wide_continue_on_failure() {
    let harness = TestHarness::new(fast_config().with_continue_on_stage_failure(true), |b| {
        b.script("a", [ScriptStep::Fail { exit_code: 1 }])
            .script("b", [ScriptStep::SucceedAfter(Duration::from_millis(150))])
    });
    let run = harness.run(two_independent_jobs()).await.unwrap();

    assert_run_status(&run, RunStatus::Failed);
    assert_job_status(&run, "b", JobStatus::Succeeded);
}

#[tokio::test]
async fn test_cancel_run_cancels_in_flight_jobs() {
    let harness = TestHarness::new(fast_config(), |b| b.script("a", [ScriptStep::Hang]).script("b", [ScriptStep::Hang]));
    let handle = harness
        .engine
        .start_run(two_independent_jobs(), "abc", Trigger::manual("dev"))
        .await
        .unwrap();
    let run_id = handle.run_id();

    let backend = harness.backend.clone();
    eventually(|| backend.in_flight() == 2).await;
    harness.engine.cancel_run(run_id, "superseded by newer push").await.unwrap();

    let run = tokio::time::timeout(Duration::from_secs(5), handle.wait()).await.unwrap().unwrap();
    assert_run_status(&run, RunStatus::Canceled);
    assert_job_status(&run, "a", JobStatus::Canceled);
    assert_job_status(&run, "b", JobStatus::Canceled);
    assert_eq!(run.cancel_reason.as_deref(), Some("superseded by newer push"));
    assert_eq!(harness.backend.cancellations().len(), 2);
    assert_eq!(harness.sink.count(names::RUN_CANCEL_REQUESTED), 1);

    // Canceling again, now that the run is finished, is a no-op.
    harness.engine.cancel_run(run_id, "again").await.unwrap();
    let stored = harness.engine.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(stored.cancel_reason.as_deref(), Some("superseded by newer push"));
}

#[tokio::test]
async fn test_cancel_after_failure_keeps_run_failed() {
    let definition = PipelineBuilder::new("ci")
        .stage_def(StageDefinition::new("build").continue_on_failure(true))
        .job(job("a", "build"))
        .job(job("b", "build"))
        .into_definition();
    let harness = TestHarness::new(fast_config(), |b| {
        b.script("a", [ScriptStep::Fail { exit_code: 1 }]).script("b", [ScriptStep::Hang])
    });
    let handle = harness
        .engine
        .start_run(definition, "abc", Trigger::manual("dev"))
        .await
        .unwrap();
    let run_id = handle.run_id();

    let mut failed = false;
    for _ in 0..200 {
        let stored = harness.engine.get_run(run_id).await.unwrap().unwrap();
        if stored.status == RunStatus::Failed {
            failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(failed, "run never reached Failed");
    assert_eq!(harness.backend.in_flight(), 1);

    harness.engine.cancel_run(run_id, "user request").await.unwrap();
    let run = tokio::time::timeout(Duration::from_secs(5), handle.wait()).await.unwrap().unwrap();

    assert_run_status(&run, RunStatus::Failed);
    assert_eq!(run.stages[0].status, RunStatus::Failed);
    assert_job_status(&run, "a", JobStatus::Failed);
    assert_job_status(&run, "b", JobStatus::Canceled);
    assert_eq!(harness.backend.cancellations().len(), 1);
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn test_timeout_fails_and_cancels_attempt() {
    let definition = PipelineBuilder::new("slow")
        .stage("build")
        .job(job("stuck", "build").with_timeout_secs(1))
        .into_definition();
    let harness = TestHarness::new(fast_config(), |b| b.script("stuck", [ScriptStep::Hang]));

    let run = harness.run(definition).await.unwrap();

    assert_run_status(&run, RunStatus::Failed);
    assert_failure_kind(&run, "stuck", FailureKind::Timeout);
    assert_eq!(harness.backend.cancellations().len(), 1);
}

#[tokio::test]
async fn test_timed_out_attempt_is_retried() {
    let definition = PipelineBuilder::new("slow")
        .stage("build")
        .job(job("stuck", "build").with_timeout_secs(1).with_retries(1))
        .into_definition();
    let harness = TestHarness::new(fast_config(), |b| b.script("stuck", [ScriptStep::Hang]));

    let run = harness.run(definition).await.unwrap();

    assert_run_status(&run, RunStatus::Succeeded);
    assert_eq!(run.jobs["stuck"].attempt_count, 2);
}

#[tokio::test]
async fn test_recover_resumes_from_store() {
    let harness = TestHarness::new(fast_config(), |b| b);
    let graph = DependencyGraph::from_definition(&build_then_test());
    let mut run = PipelineRun::new(Uuid::now_v7(), &graph, "abc", Trigger::default(), now_utc());
    run.started_at = Some(now_utc());
    {
        let build = run.jobs.get_mut("build").unwrap();
        build.status = JobStatus::Succeeded;
        build.attempt_count = 1;
        build.finished_at = Some(now_utc());
    }
    run.refresh(now_utc());
    harness.store.create(&run).await.unwrap();

    let handles = harness.engine.recover().await.unwrap();
    assert_eq!(handles.len(), 1);
    let recovered = handles.into_iter().next().unwrap().wait().await.unwrap();

    assert_run_status(&recovered, RunStatus::Succeeded);
    assert_eq!(harness.backend.submitted_jobs(), vec!["test"]);
}

#[tokio::test]
async fn test_recover_interrupted_submission() {
    let definition = PipelineBuilder::new("interrupted")
        .stage("build")
        .job(job("a", "build").with_retries(1))
        .into_definition();
    let graph = DependencyGraph::from_definition(&definition);
    let harness = TestHarness::new(fast_config(), |b| b);

    let mut run = PipelineRun::new(Uuid::now_v7(), &graph, "abc", Trigger::default(), now_utc());
    run.started_at = Some(now_utc());
    {
        let a = run.jobs.get_mut("a").unwrap();
        a.status = JobStatus::Dispatched;
        a.attempt_count = 1;
        a.backend = Some("local".to_string());
        a.dispatched_at = Some(now_utc());
    }
    run.refresh(now_utc());
    harness.store.create(&run).await.unwrap();

    let handles = harness.engine.recover().await.unwrap();
    let recovered = handles.into_iter().next().unwrap().wait().await.unwrap();

    assert_run_status(&recovered, RunStatus::Succeeded);
    assert_eq!(recovered.jobs["a"].attempt_count, 2);
    let submissions = harness.backend.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].attempt, 2);
}

#[tokio::test]
async fn test_recover_skips_owned_and_finished_runs() {
    let harness = TestHarness::new(fast_config(), |b| b.script("a", [ScriptStep::Hang]).script("b", [ScriptStep::Hang]));
    let handle = harness
        .engine
        .start_run(two_independent_jobs(), "abc", Trigger::default())
        .await
        .unwrap();

    assert!(harness.engine.recover().await.unwrap().is_empty());
    assert_eq!(harness.engine.active_runs(), vec![handle.run_id()]);

    harness.engine.cancel_run(handle.run_id(), "done").await.unwrap();
    handle.wait().await.unwrap();
    assert!(harness.engine.recover().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_per_backend_limit() {
    let definition = PipelineBuilder::new("mixed")
        .stage("build")
        .job(job("c1", "build").on_backend("cluster"))
        .job(job("c2", "build").on_backend("cluster"))
        .job(job("c3", "build").on_backend("cluster"))
        .job(job("l1", "build"))
        .into_definition();
    let config = fast_config().with_max_parallel_jobs(4).with_backend_limit("cluster", 1);
    let harness = TestHarness::with_backends(config, |publisher| {
        vec![
            Arc::new(ScriptedBackend::new(publisher.clone())),
            Arc::new(ScriptedBackend::new(publisher).with_name("cluster")),
        ]
    });

    let run = harness.run(definition).await.unwrap();

    assert_run_status(&run, RunStatus::Succeeded);
    let cluster = &harness.backends[1];
    assert_eq!(cluster.submitted_jobs(), vec!["c1", "c2", "c3"]);
    assert_eq!(cluster.max_in_flight(), 1);
    assert_eq!(harness.backend.submitted_jobs(), vec!["l1"]);
    assert_eq!(run.jobs["c2"].backend.as_deref(), Some("cluster"));
}

#[tokio::test]
async fn test_unknown_backend_fails_job() {
    let definition = PipelineBuilder::new("gpu")
        .stage("build")
        .job(job("train", "build").on_backend("gpu"))
        .into_definition();
    let harness = TestHarness::new(fast_config(), |b| b);

    let run = harness.run(definition).await.unwrap();

    assert_run_status(&run, RunStatus::Failed);
    assert_failure_kind(&run, "train", FailureKind::Submit);
    assert_eq!(harness.sink.count(names::JOB_REJECTED), 1);
    assert!(harness.backend.submitted_jobs().is_empty());
}

#[tokio::test]
async fn test_rejected_submission_is_not_retried() {
    let definition = PipelineBuilder::new("pull")
        .stage("build")
        .job(job("a", "build").with_retries(3))
        .job(job("b", "build"))
        .into_definition();
    let harness = TestHarness::new(fast_config(), |b| {
        b.script("a", [ScriptStep::RejectSubmit("manifest unknown".to_string())])
            .script("b", [ScriptStep::Hang])
    });

    let run = harness.run(definition).await.unwrap();

    assert_run_status(&run, RunStatus::Failed);
    assert_job_status(&run, "a", JobStatus::Failed);
    assert_eq!(run.jobs["a"].attempt_count, 1);
    // The sibling was canceled with its stage.
    assert_job_status(&run, "b", JobStatus::Canceled);
}

#[tokio::test]
async fn test_cycle_is_rejected_before_recording() {
    let definition = PipelineBuilder::new("loop")
        .stage("build")
        .job(job("a", "build").needs("b"))
        .job(job("b", "build").needs("a"))
        .into_definition();
    let harness = TestHarness::new(fast_config(), |b| b);

    let err = harness.run(definition).await.unwrap_err();

    match err {
        ConveyorError::Configuration(err) => {
            assert_eq!(err.kind, ConfigurationErrorKind::Cycle);
            assert_eq!(err.info.code, "GRAPH-001-CYCLE");
        }
        other => panic!("expected a configuration error, got {other:?}"),
    }
    assert!(harness.store.is_empty());
    assert!(harness.backend.submitted_jobs().is_empty());
}

#[tokio::test]
async fn test_events_for_unknown_runs_do_not_disturb() {
    let harness = TestHarness::new(fast_config(), |b| b);
    let stray = ExecutionEvent::succeeded(Uuid::now_v7(), "a").with_attempt(1);
    assert!(harness.publisher().publish(stray).await);

    let run = harness.run(two_independent_jobs()).await.unwrap();

    assert_run_status(&run, RunStatus::Succeeded);
    assert_eq!(harness.sink.count(names::EVENT_UNKNOWN_RUN), 1);
}

#[tokio::test]
async fn test_stale_attempt_event_is_ignored() {
    let definition = PipelineBuilder::new("stale")
        .stage("build")
        .job(job("a", "build"))
        .into_definition();
    let harness = TestHarness::new(fast_config(), |b| b.script("a", [ScriptStep::Hang]));
    let handle = harness.engine.start_run(definition, "abc", Trigger::default()).await.unwrap();
    let run_id = handle.run_id();

    let backend = harness.backend.clone();
    eventually(|| backend.in_flight() == 1).await;

    // A late report from an attempt that never existed.
    let publisher = harness.publisher();
    publisher.publish(ExecutionEvent::succeeded(run_id, "a").with_attempt(7)).await;
    eventually(|| harness.sink.count(names::EVENT_STALE) == 1).await;

    let stored = harness.engine.get_run(run_id).await.unwrap().unwrap();
    assert_job_status(&stored, "a", JobStatus::Running);

    publisher.publish(ExecutionEvent::succeeded(run_id, "a").with_attempt(1)).await;
    let run = handle.wait().await.unwrap();
    assert_run_status(&run, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_store_unavailable_on_start() {
    let mut store = MockRunStateStore::new();
    store
        .expect_create()
        .returning(|_| Err(StoreError::Unavailable("connection refused".to_string())));
    let (_publisher, stream) = event_channel(8);
    let engine = Engine::new(SchedulerContext::new(Arc::new(store), BackendRegistry::new()), stream);

    let err = engine
        .start_run(two_independent_jobs(), "abc", Trigger::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ConveyorError::Store(StoreError::Unavailable(_))));
    assert!(engine.active_runs().is_empty());
}

#[tokio::test]
async fn test_store_failure_mid_run_surfaces() {
    let mut store = MockRunStateStore::new();
    store.expect_create().returning(|_| Ok(()));
    store
        .expect_save()
        .returning(|_| Err(StoreError::Unavailable("disk full".to_string())));
    let (publisher, stream) = event_channel(8);
    let backend = Arc::new(ScriptedBackend::new(publisher));
    let ctx = SchedulerContext::new(Arc::new(store), BackendRegistry::new().register(backend.clone()))
        .with_config(fast_config());
    let engine = Engine::new(ctx, stream);

    let handle = engine
        .start_run(two_independent_jobs(), "abc", Trigger::default())
        .await
        .unwrap();
    let err = handle.wait().await.unwrap_err();

    assert!(matches!(err, ConveyorError::Store(StoreError::Unavailable(_))));
    assert!(backend.submitted_jobs().is_empty());
}
