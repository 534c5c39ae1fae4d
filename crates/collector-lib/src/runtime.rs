//! Wiring of discovery, the job manager and the output pipe

use crate::clients::{ClientFactory, DefaultClients};
use crate::confgroup::DefaultsLookup;
use crate::discovery::{Discoverer, DiscoveryManager, DummyDiscoverer, FileReader, FileWatcher};
use crate::health::{Component, HealthBoard};
use crate::job::{JobSettings, StatusTable};
use crate::jobmgr::{JobManager, DEFAULT_GRACE};
use crate::observability::StructuredLogger;
use crate::output::Emitter;
use crate::registry::Registry;
use anyhow::{bail, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// ConfGroups buffered between discovery and the job manager
const GROUP_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Job config files and directories. Empty runs one default job per module.
    pub paths: Vec<PathBuf>,
    /// Keep watching `paths` instead of reading them once
    pub watch: bool,
    pub grace: Duration,
    pub settings: JobSettings,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            watch: true,
            grace: DEFAULT_GRACE,
            settings: JobSettings::default(),
        }
    }
}

pub struct Runtime {
    options: RuntimeOptions,
    registry: Arc<Registry>,
    factory: Arc<dyn ClientFactory>,
    output: Box<dyn Write + Send>,
    health: HealthBoard,
    status: StatusTable,
}

impl Runtime {
    pub fn new(options: RuntimeOptions, registry: Arc<Registry>) -> Self {
        Self {
            options,
            registry,
            factory: Arc::new(DefaultClients),
            output: Box::new(std::io::stdout()),
            health: HealthBoard::new(),
            status: StatusTable::default(),
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Write the protocol somewhere other than stdout
    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = output;
        self
    }

    pub fn health(&self) -> HealthBoard {
        self.health.clone()
    }

    pub fn status(&self) -> StatusTable {
        self.status.clone()
    }

    fn discovery(&self) -> DiscoveryManager {
        let defaults: Arc<dyn DefaultsLookup> = self.registry.clone();
        let discoverer: Box<dyn Discoverer> = if self.options.paths.is_empty() {
            let modules = self.registry.names().into_iter().map(str::to_string).collect();
            Box::new(DummyDiscoverer::new(modules, defaults))
        } else if self.options.watch {
            Box::new(FileWatcher::new(self.options.paths.clone(), defaults))
        } else {
            Box::new(FileReader::new(self.options.paths.clone(), defaults))
        };
        DiscoveryManager::new(self.registry.clone()).with(discoverer)
    }

    /// Run until `cancel` fires or the parent stops reading our output.
    ///
    /// Losing the output is an error; external cancellation is not.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let logger = StructuredLogger::new("collector");
        if self.registry.is_empty() {
            bail!("no modules registered");
        }
        logger.log_startup(env!("CARGO_PKG_VERSION"), self.registry.len());

        let shutdown = cancel.child_token();
        let fatal = CancellationToken::new();
        let discovery = self.discovery();
        let emitter = Arc::new(Emitter::new(self.output, fatal.clone()));
        let manager = JobManager::new(self.registry.clone(), self.factory.clone(), emitter)
            .with_settings(self.options.settings.clone())
            .with_grace(self.options.grace)
            .with_status(self.status.clone())
            .with_health(self.health.clone());

        let (tx, rx) = mpsc::channel(GROUP_BUFFER);
        let manager_task = tokio::spawn(manager.run(rx, shutdown.clone()));

        let health = self.health.clone();
        let discovery_cancel = shutdown.clone();
        let discovery_task = tokio::spawn(async move {
            let res = discovery.run(discovery_cancel, tx).await;
            if let Err(e) = &res {
                health.failed(Component::Discovery, e.to_string());
            }
            res
        });

        let output_lost = tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = fatal.cancelled() => true,
        };
        if output_lost {
            self.health.failed(Component::Emitter, "output closed");
        }
        shutdown.cancel();

        match discovery_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Discovery failed"),
            Err(e) => warn!(error = %e, "Discovery task panicked"),
        }
        if let Err(e) = manager_task.await {
            warn!(error = %e, "Job manager task panicked");
        }

        if output_lost {
            logger.log_shutdown("output closed");
            bail!("output to the parent was closed");
        }
        logger.log_shutdown("cancelled");
        info!("Collector runtime stopped");
        Ok(())
    }
}

/// Run the built-in runtime over `roots`, writing the protocol to stdout
pub async fn run(roots: Vec<PathBuf>, registry: Arc<Registry>, cancel: CancellationToken) -> Result<()> {
    let options = RuntimeOptions {
        paths: roots,
        ..RuntimeOptions::default()
    };
    Runtime::new(options, registry).run(cancel).await
}
