//! Job runner and per-job chart state
//!
//! A job is one configured module instance driven by its own tokio task:
//! init, check (with retries), announce, then the collect loop until stopped
//! or dead.

mod runner;
mod tracker;

#[cfg(test)]
mod tests;

pub use runner::{Job, JobExit, JobSettings, STRIKE_THRESHOLD};
pub use tracker::ChartTracker;

use crate::confgroup::JobKey;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

/// Lifecycle phase of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Initialising,
    CheckRetrying,
    Running,
    Stopped,
    Dead,
}

/// Row of the job status table
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub module: String,
    pub name: String,
    pub source: String,
    pub state: JobState,
    pub update_every: u64,
    /// Consecutive failed collections
    pub strikes: u32,
    pub last_error: Option<String>,
}

/// Job states shared between the manager, the runners and the status API
pub type StatusTable = Arc<DashMap<JobKey, JobStatus>>;
