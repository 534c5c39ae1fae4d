//! Collector module contract
//!
//! A module samples one external system. It is created by the registry,
//! owned by exactly one job runner and driven through
//! init → check → charts → collect* → cleanup.

mod base;
mod charts;
mod metrics;

pub use base::Base;
pub use charts::{Chart, ChartError, ChartOpts, ChartType, Charts, Dim, DimAlgorithm, Var};
pub use metrics::MetricBag;

use crate::clients::ClientSet;
use crate::confgroup::JobConfig;
use crate::error::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::ops::BitOr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared clients a module may ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const HTTP: Capabilities = Capabilities(1);
    pub const EXEC: Capabilities = Capabilities(1 << 1);
    pub const SOCKET: Capabilities = Capabilities(1 << 2);
    pub const ICMP: Capabilities = Capabilities(1 << 3);
    pub const PCF: Capabilities = Capabilities(1 << 4);

    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Self) -> Self::Output {
        Capabilities(self.0 | rhs.0)
    }
}

/// Everything a module sees of its job
#[derive(Clone)]
pub struct JobContext {
    config: JobConfig,
    cancel: CancellationToken,
    clients: ClientSet,
}

impl JobContext {
    pub fn new(config: JobConfig, cancel: CancellationToken, clients: ClientSet) -> Self {
        Self {
            config,
            cancel,
            clients,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Decode the job's options into the module's option record
    pub fn options<T: DeserializeOwned>(&self) -> Result<T> {
        self.config.decode()
    }

    /// Fires when the job is stopping
    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Client factories, restricted to the module's declared capabilities
    pub fn clients(&self) -> &ClientSet {
        &self.clients
    }
}

#[async_trait]
pub trait Module: Send {
    /// Clients the runner lets this module build
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    /// Validate options and build clients. Errors are final.
    async fn init(&mut self, ctx: &JobContext) -> Result<()>;

    /// Probe the target once
    async fn check(&mut self, ctx: &JobContext) -> Result<()>;

    /// Charts known before the first collection
    fn charts(&self) -> Charts;

    /// Sample the target. New charts and dimensions go through `charts`.
    async fn collect(&mut self, ctx: &JobContext, charts: &mut Charts) -> Result<MetricBag>;

    /// Release clients and connections
    async fn cleanup(&mut self, _ctx: &JobContext) {}

    /// Per-collection timeout chosen by the module, if any
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities() {
        let caps = Capabilities::HTTP | Capabilities::EXEC;
        assert!(caps.contains(Capabilities::HTTP));
        assert!(caps.contains(Capabilities::EXEC));
        assert!(!caps.contains(Capabilities::ICMP));
        assert!(caps.contains(Capabilities::NONE));
    }
}
