//! Testing utilities for conveyor.
//!
//! This module provides:
//! - A scripted execution backend
//! - Pipeline fixtures and an engine harness
//! - Assertions on run records

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_failure_kind, assert_job_status, assert_run_status, assert_settled};
pub use fixtures::{
    build_then_test, diamond, fast_config, job, two_independent_jobs, TestHarness, RUN_DEADLINE,
};
pub use mocks::{ScriptStep, ScriptedBackend};
