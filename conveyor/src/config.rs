//! Scheduler and process settings.
//!
//! [`Settings`] is read from a JSON file; every field has a default, and a
//! few can be overridden through `CONVEYOR_*` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::SettingsError;
use crate::scheduler::BackoffPolicy;

/// Environment variable overriding [`SchedulerConfig::max_parallel_jobs`].
pub const ENV_MAX_PARALLEL_JOBS: &str = "CONVEYOR_MAX_PARALLEL_JOBS";
/// Environment variable overriding [`SchedulerConfig::max_active_runs`].
pub const ENV_MAX_ACTIVE_RUNS: &str = "CONVEYOR_MAX_ACTIVE_RUNS";
/// Environment variable selecting a file store at the given directory.
pub const ENV_STORE_PATH: &str = "CONVEYOR_STORE_PATH";
/// Environment variable selecting the log format (`pretty` or `json`).
pub const ENV_LOG_FORMAT: &str = "CONVEYOR_LOG_FORMAT";

const fn default_max_parallel_jobs() -> usize {
    4
}

const fn default_submit_timeout_ms() -> u64 {
    30_000
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

const fn default_event_channel_capacity() -> usize {
    1_024
}

const fn default_max_active_runs() -> usize {
    16
}

/// Tunables for scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Jobs of one run allowed in flight at once.
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: usize,
    /// Per-backend in-flight caps.
    #[serde(default)]
    pub per_backend_limits: BTreeMap<String, usize>,
    /// Bound on a single `submit` call.
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    /// Longest the scheduler sleeps without an event or deadline.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Default for letting same-stage siblings finish after a failure.
    #[serde(default)]
    pub continue_on_stage_failure: bool,
    /// Delay policy for retries.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Buffer size of each run's event channel.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Runs coordinated concurrently by one engine.
    #[serde(default = "default_max_active_runs")]
    pub max_active_runs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: default_max_parallel_jobs(),
            per_backend_limits: BTreeMap::new(),
            submit_timeout_ms: default_submit_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            continue_on_stage_failure: false,
            backoff: BackoffPolicy::default(),
            event_channel_capacity: default_event_channel_capacity(),
            max_active_runs: default_max_active_runs(),
        }
    }
}

impl SchedulerConfig {
    /// Sets the per-run parallelism.
    #[must_use]
    pub fn with_max_parallel_jobs(mut self, jobs: usize) -> Self {
        self.max_parallel_jobs = jobs;
        self
    }

    /// Caps in-flight jobs on one backend.
    #[must_use]
    pub fn with_backend_limit(mut self, backend: impl Into<String>, limit: usize) -> Self {
        self.per_backend_limits.insert(backend.into(), limit);
        self
    }

    /// Sets the submit timeout.
    #[must_use]
    pub fn with_submit_timeout_ms(mut self, timeout: u64) -> Self {
        self.submit_timeout_ms = timeout;
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    /// Sets the continue-on-failure default.
    #[must_use]
    pub fn with_continue_on_stage_failure(mut self, enabled: bool) -> Self {
        self.continue_on_stage_failure = enabled;
        self
    }

    /// Sets the retry backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the number of concurrently coordinated runs.
    #[must_use]
    pub fn with_max_active_runs(mut self, runs: usize) -> Self {
        self.max_active_runs = runs;
        self
    }

    /// Submit timeout as a duration.
    #[must_use]
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Checks values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Invalid`] for zero limits or timeouts.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let checks = [
            ("scheduler.max_parallel_jobs", self.max_parallel_jobs as u64),
            ("scheduler.submit_timeout_ms", self.submit_timeout_ms),
            ("scheduler.poll_interval_ms", self.poll_interval_ms),
            ("scheduler.event_channel_capacity", self.event_channel_capacity as u64),
            ("scheduler.max_active_runs", self.max_active_runs as u64),
        ];
        if let Some((key, value)) = checks.iter().find(|(_, v)| *v == 0) {
            return Err(SettingsError::Invalid {
                key: (*key).to_string(),
                value: value.to_string(),
            });
        }
        if let Some((backend, _)) = self.per_backend_limits.iter().find(|(_, l)| **l == 0) {
            return Err(SettingsError::Invalid {
                key: format!("scheduler.per_backend_limits.{backend}"),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Which run store to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Process memory.
    #[default]
    Memory,
    /// JSON documents in a directory.
    File,
}

/// Run store selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Store kind.
    #[serde(default)]
    pub kind: StoreKind,
    /// Directory for the file store.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(SettingsError::Invalid {
                key: "log_format".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Scheduler tunables.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Run store selection.
    #[serde(default)]
    pub store: StoreSettings,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Settings {
    /// Reads settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parses settings from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] on malformed input.
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        serde_json::from_str(json).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Applies overrides from `lookup`, typically the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Invalid`] for unparseable values.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        if let Some(value) = lookup(ENV_MAX_PARALLEL_JOBS) {
            self.scheduler.max_parallel_jobs = parse_count(ENV_MAX_PARALLEL_JOBS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_ACTIVE_RUNS) {
            self.scheduler.max_active_runs = parse_count(ENV_MAX_ACTIVE_RUNS, &value)?;
        }
        if let Some(value) = lookup(ENV_STORE_PATH) {
            self.store = StoreSettings {
                kind: StoreKind::File,
                path: Some(PathBuf::from(value)),
            };
        }
        if let Some(value) = lookup(ENV_LOG_FORMAT) {
            self.log_format = value.parse()?;
        }
        Ok(self)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Invalid`] for unparseable values.
    pub fn apply_env(self) -> Result<Self, SettingsError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Checks the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Invalid`] for the first unusable value.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.scheduler.validate()?;
        if self.store.kind == StoreKind::File && self.store.path.is_none() {
            return Err(SettingsError::Invalid {
                key: "store.path".to_string(),
                value: "<unset>".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}
