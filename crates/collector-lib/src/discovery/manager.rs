//! Fan-in of all discoverers

use super::Discoverer;
use crate::confgroup::ConfGroup;
use crate::registry::Registry;
use anyhow::{bail, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct DiscoveryManager {
    registry: Arc<Registry>,
    discoverers: Vec<Box<dyn Discoverer>>,
}

impl DiscoveryManager {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            discoverers: Vec::new(),
        }
    }

    pub fn add(&mut self, discoverer: Box<dyn Discoverer>) {
        self.discoverers.push(discoverer);
    }

    pub fn with(mut self, discoverer: Box<dyn Discoverer>) -> Self {
        self.add(discoverer);
        self
    }

    /// Run every discoverer into `tx` until all finish or `cancel` fires.
    ///
    /// The sender is dropped on return, which tells the job manager that no
    /// more groups will come.
    pub async fn run(self, cancel: CancellationToken, tx: mpsc::Sender<ConfGroup>) -> Result<()> {
        if self.registry.is_empty() {
            bail!("empty config registry");
        }
        if self.discoverers.is_empty() {
            bail!("discoverers not set");
        }

        info!(discoverers = self.discoverers.len(), "Starting discovery");
        let runs = self.discoverers.into_iter().map(|discoverer| {
            let tx = tx.clone();
            let cancel = cancel.clone();
            async move {
                let name = discoverer.name();
                match discoverer.run(cancel, tx).await {
                    Ok(()) => debug!(discoverer = name, "Discoverer finished"),
                    Err(e) => warn!(discoverer = name, error = %e, "Discoverer failed"),
                }
            }
        }).collect::<Vec<_>>();
        drop(tx);

        join_all(runs).await;
        Ok(())
    }
}
