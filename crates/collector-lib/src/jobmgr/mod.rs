//! Job manager
//!
//! Consumes ConfGroups from discovery and keeps one runner per live job
//! identity. Each group replaces the previous group of the same source, so
//! the manager diffs the two and starts, stops or restarts runners.

mod manager;

#[cfg(test)]
mod tests;

pub use manager::{JobManager, DEFAULT_GRACE};

use crate::confgroup::{JobConfig, JobKey};
use std::collections::HashMap;

/// What a new group changes for one source
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Plan {
    pub start: Vec<JobConfig>,
    pub stop: Vec<JobKey>,
    pub restart: Vec<JobConfig>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.stop.is_empty() && self.restart.is_empty()
    }
}

/// Diff the previous configs of a source against its new group.
///
/// `next` must not contain duplicate identities.
pub(crate) fn diff(previous: &HashMap<JobKey, JobConfig>, next: &[JobConfig]) -> Plan {
    let mut plan = Plan::default();

    for config in next {
        match previous.get(&config.key()) {
            None => plan.start.push(config.clone()),
            Some(old) if old != config => plan.restart.push(config.clone()),
            Some(_) => {}
        }
    }

    let mut removed: Vec<JobKey> = previous
        .keys()
        .filter(|key| !next.iter().any(|c| &c.key() == *key))
        .cloned()
        .collect();
    removed.sort();
    plan.stop = removed;

    plan
}
