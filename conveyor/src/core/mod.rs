//! Core domain model types for conveyor.
//!
//! This module contains the fundamental types shared by every component:
//! - Run and job status enums
//! - Execution events delivered by backends
//! - Recorded failure causes

mod event;
mod failure;
mod status;

pub use event::{generate_idempotency_key, ExecutionEvent, ReportedStatus};
pub use failure::{FailureKind, JobFailure};
pub use status::{JobStatus, RunStatus};
