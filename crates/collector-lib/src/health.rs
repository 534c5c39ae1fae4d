//! Health board for the runtime's long-lived parts
//!
//! Discovery, the job manager and the emitter post their condition here.
//! The agent is ready once the first config group has been applied and no
//! part has failed. The binary's HTTP endpoints serve [`Snapshot`] and
//! [`Readiness`].

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// The parts of the runtime that report health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Discovery,
    JobManager,
    Emitter,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Discovery, Component::JobManager, Component::Emitter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Discovery => "discovery",
            Component::JobManager => "job_manager",
            Component::Emitter => "emitter",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from best to worst, so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix seconds of the last change
    pub since: i64,
}

impl Report {
    fn new(status: Status, message: Option<String>) -> Self {
        Self {
            status,
            message,
            since: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub status: Status,
    pub components: BTreeMap<Component, Report>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
struct Board {
    reports: BTreeMap<Component, Report>,
    configured: bool,
}

/// Shared, cheaply cloned handle. Every component starts healthy.
#[derive(Debug, Clone)]
pub struct HealthBoard {
    tx: Arc<watch::Sender<Board>>,
}

impl Default for HealthBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthBoard {
    pub fn new() -> Self {
        let reports = Component::ALL
            .into_iter()
            .map(|c| (c, Report::new(Status::Healthy, None)))
            .collect();
        let (tx, _) = watch::channel(Board {
            reports,
            configured: false,
        });
        Self { tx: Arc::new(tx) }
    }

    fn post(&self, component: Component, status: Status, message: Option<String>) {
        self.tx.send_modify(|board| {
            board.reports.insert(component, Report::new(status, message));
        });
    }

    pub fn healthy(&self, component: Component) {
        self.post(component, Status::Healthy, None);
    }

    pub fn degraded(&self, component: Component, message: impl Into<String>) {
        self.post(component, Status::Degraded, Some(message.into()));
    }

    pub fn failed(&self, component: Component, message: impl Into<String>) {
        self.post(component, Status::Unhealthy, Some(message.into()));
    }

    /// The first config group went through the job manager
    pub fn mark_configured(&self) {
        self.tx.send_if_modified(|board| !std::mem::replace(&mut board.configured, true));
    }

    pub fn snapshot(&self) -> Snapshot {
        let board = self.tx.borrow();
        let status = board
            .reports
            .values()
            .map(|r| r.status)
            .max()
            .unwrap_or(Status::Healthy);
        Snapshot {
            status,
            components: board.reports.clone(),
        }
    }

    pub fn readiness(&self) -> Readiness {
        let board = self.tx.borrow();
        let failed: Vec<&str> = board
            .reports
            .iter()
            .filter(|(_, r)| r.status == Status::Unhealthy)
            .map(|(c, _)| c.as_str())
            .collect();

        let reason = if !board.configured {
            Some("no configuration applied yet".to_string())
        } else if !failed.is_empty() {
            Some(format!("failed: {}", failed.join(", ")))
        } else {
            None
        };
        Readiness {
            ready: reason.is_none(),
            reason,
        }
    }
}
