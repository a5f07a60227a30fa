//! Utility functions for run ids and timestamp handling.

pub mod timestamps;
mod uuid_utils;

pub use timestamps::{add_duration, now_utc, until, Timestamp};
pub use uuid_utils::{generate_run_id, short_id};
