//! Scripted execution backend for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{ExecutionBackend, ExecutionHandle, JobSubmission};
use crate::core::ExecutionEvent;
use crate::errors::{CancelError, SubmitError};
use crate::events::{event_channel, EventPublisher};

/// What one attempt of a job does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Runs and exits 0.
    Succeed,
    /// Runs for the given time instead of the default, then exits 0.
    SucceedAfter(Duration),
    /// Runs and exits with the given code.
    Fail {
        /// Reported exit code.
        exit_code: i32,
    },
    /// The submission itself is refused.
    RejectSubmit(String),
    /// Runs until canceled.
    Hang,
}

/// A submitted attempt still running.
#[derive(Debug, Clone)]
struct Active {
    submission: JobSubmission,
}

/// An in-process backend whose outcomes are scripted per job.
///
/// Each submission consumes the next step of its job's script; jobs without
/// a script (or with an exhausted one) succeed. Accepted attempts report
/// Running then their terminal status through the publisher, each event
/// carrying the attempt number and a per-attempt sequence unless bare
/// events are enabled.
#[derive(Debug)]
pub struct ScriptedBackend {
    name: String,
    publisher: EventPublisher,
    scripts: Mutex<HashMap<String, VecDeque<ScriptStep>>>,
    submit_delay: Duration,
    run_time: Duration,
    redeliver: bool,
    bare_events: bool,
    submissions: Mutex<Vec<JobSubmission>>,
    cancellations: Mutex<Vec<ExecutionHandle>>,
    abandoned: Mutex<Vec<JobSubmission>>,
    active: Arc<DashMap<String, Active>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    /// Creates a backend named "local" publishing into `publisher`.
    #[must_use]
    pub fn new(publisher: EventPublisher) -> Self {
        Self {
            name: "local".to_string(),
            publisher,
            scripts: Mutex::new(HashMap::new()),
            submit_delay: Duration::ZERO,
            run_time: Duration::from_millis(10),
            redeliver: false,
            bare_events: false,
            submissions: Mutex::new(Vec::new()),
            cancellations: Mutex::new(Vec::new()),
            abandoned: Mutex::new(Vec::new()),
            active: Arc::new(DashMap::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a backend whose events go nowhere, for registry tests.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        let (publisher, _stream) = event_channel(1);
        Self::new(publisher).with_name(name)
    }

    /// Sets the backend name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Appends steps to a job's script.
    #[must_use]
    pub fn script(mut self, job_id: impl Into<String>, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        self.scripts.get_mut().entry(job_id.into()).or_default().extend(steps);
        self
    }

    /// Delays every submit call.
    #[must_use]
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    /// Sets how long an accepted attempt runs before exiting.
    #[must_use]
    pub fn with_run_time(mut self, run_time: Duration) -> Self {
        self.run_time = run_time;
        self
    }

    /// Publishes every terminal event twice.
    #[must_use]
    pub fn with_redelivery(mut self) -> Self {
        self.redeliver = true;
        self
    }

    /// Publishes events without attempt numbers or sequences.
    #[must_use]
    pub fn with_bare_events(mut self) -> Self {
        self.bare_events = true;
        self
    }

    /// Every accepted submission, in order.
    #[must_use]
    pub fn submissions(&self) -> Vec<JobSubmission> {
        self.submissions.lock().clone()
    }

    /// Job ids of accepted submissions, in order.
    #[must_use]
    pub fn submitted_jobs(&self) -> Vec<String> {
        self.submissions.lock().iter().map(|s| s.job_id.clone()).collect()
    }

    /// Number of accepted submissions of one job.
    #[must_use]
    pub fn attempts_of(&self, job_id: &str) -> usize {
        self.submissions.lock().iter().filter(|s| s.job_id == job_id).count()
    }

    /// Handles passed to `cancel`, in order.
    #[must_use]
    pub fn cancellations(&self) -> Vec<ExecutionHandle> {
        self.cancellations.lock().clone()
    }

    /// Submissions passed to `abandon`, in order.
    #[must_use]
    pub fn abandoned(&self) -> Vec<JobSubmission> {
        self.abandoned.lock().clone()
    }

    /// Attempts currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of attempts observed running at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, job_id: &str) -> ScriptStep {
        self.scripts
            .lock()
            .get_mut(job_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptStep::Succeed)
    }

    fn handle_for(&self, job: &JobSubmission) -> ExecutionHandle {
        ExecutionHandle::new(format!("{}-{}-{}-{}", self.name, job.run_id.simple(), job.job_id, job.attempt))
    }
}

fn stamp(event: ExecutionEvent, attempt: u32, sequence: u64, bare: bool) -> ExecutionEvent {
    if bare {
        event
    } else {
        event.with_attempt(attempt).with_sequence(sequence)
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, job: &JobSubmission) -> Result<ExecutionHandle, SubmitError> {
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }

        let step = self.next_step(&job.job_id);
        if let ScriptStep::RejectSubmit(ref reason) = step {
            return Err(SubmitError::Rejected(reason.clone()));
        }

        let handle = self.handle_for(job);
        self.submissions.lock().push(job.clone());
        self.active.insert(handle.as_str().to_string(), Active { submission: job.clone() });
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let publisher = self.publisher.clone();
        let active = self.active.clone();
        let in_flight = self.in_flight.clone();
        let run_time = self.run_time;
        let redeliver = self.redeliver;
        let bare = self.bare_events;
        let key = handle.as_str().to_string();
        let job = job.clone();

        tokio::spawn(async move {
            publisher
                .publish(stamp(ExecutionEvent::running(job.run_id, job.job_id.clone()), job.attempt, 1, bare))
                .await;

            let mut run_time = run_time;
            let terminal = match step {
                ScriptStep::Succeed => ExecutionEvent::succeeded(job.run_id, job.job_id.clone()),
                ScriptStep::SucceedAfter(after) => {
                    run_time = after;
                    ExecutionEvent::succeeded(job.run_id, job.job_id.clone())
                }
                ScriptStep::Fail { exit_code } => {
                    ExecutionEvent::failed(job.run_id, job.job_id.clone(), format!("exited with code {exit_code}"))
                        .with_exit_code(exit_code)
                }
                ScriptStep::Hang | ScriptStep::RejectSubmit(_) => return,
            };
            tokio::time::sleep(run_time).await;

            // A cancel may have claimed the attempt first.
            if active.remove(&key).is_none() {
                return;
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);

            let terminal = stamp(terminal, job.attempt, 2, bare);
            if redeliver {
                publisher.publish(terminal.clone()).await;
            }
            publisher.publish(terminal).await;
        });

        Ok(handle)
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), CancelError> {
        self.cancellations.lock().push(handle.clone());
        if let Some((_, Active { submission })) = self.active.remove(handle.as_str()) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let event = ExecutionEvent::canceled(submission.run_id, submission.job_id);
            self.publisher
                .publish(stamp(event, submission.attempt, 2, self.bare_events))
                .await;
        }
        Ok(())
    }

    async fn abandon(&self, job: &JobSubmission) -> Result<(), CancelError> {
        self.abandoned.lock().push(job.clone());
        Ok(())
    }
}
