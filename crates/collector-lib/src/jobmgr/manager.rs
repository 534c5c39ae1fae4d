//! Runner lifecycle bookkeeping

use super::diff;
use crate::clients::ClientFactory;
use crate::confgroup::{ConfGroup, JobConfig, JobKey};
use crate::health::{Component, HealthBoard};
use crate::job::{Job, JobExit, JobSettings, JobState, JobStatus, StatusTable};
use crate::observability::RuntimeMetrics;
use crate::output::Emitter;
use crate::registry::Registry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a stopping runner may take before it is aborted
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

struct Runner {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type Exit = (JobKey, u64, JobExit);

/// Grace expired for a stopped runner of this generation
type Overdue = (JobKey, u64);

/// Owns every runner task. Driven by a single task over the ConfGroup stream
/// and runner exit notifications; it never waits on a runner outside
/// shutdown.
pub struct JobManager {
    registry: Arc<Registry>,
    factory: Arc<dyn ClientFactory>,
    emitter: Arc<Emitter>,
    settings: JobSettings,
    grace: Duration,
    status: StatusTable,
    health: Option<HealthBoard>,
    /// Last accepted configs per source
    sources: HashMap<String, HashMap<JobKey, JobConfig>>,
    owners: HashMap<JobKey, String>,
    runners: HashMap<JobKey, Runner>,
    generation: u64,
    exits_tx: mpsc::UnboundedSender<Exit>,
    exits_rx: mpsc::UnboundedReceiver<Exit>,
    overdue_tx: mpsc::UnboundedSender<Overdue>,
    overdue_rx: mpsc::UnboundedReceiver<Overdue>,
    metrics: RuntimeMetrics,
    ready: bool,
}

impl JobManager {
    pub fn new(registry: Arc<Registry>, factory: Arc<dyn ClientFactory>, emitter: Arc<Emitter>) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let (overdue_tx, overdue_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            factory,
            emitter,
            settings: JobSettings::default(),
            grace: DEFAULT_GRACE,
            status: StatusTable::default(),
            health: None,
            sources: HashMap::new(),
            owners: HashMap::new(),
            runners: HashMap::new(),
            generation: 0,
            exits_tx,
            exits_rx,
            overdue_tx,
            overdue_rx,
            metrics: RuntimeMetrics::new(),
            ready: false,
        }
    }

    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Report job states into an existing table
    pub fn with_status(mut self, status: StatusTable) -> Self {
        self.status = status;
        self
    }

    pub fn with_health(mut self, health: HealthBoard) -> Self {
        self.health = Some(health);
        self
    }

    /// Shared view of job states
    pub fn status(&self) -> StatusTable {
        self.status.clone()
    }

    /// Process groups until `cancel` fires, then stop every runner.
    ///
    /// A closed group channel only means discovery is done; running jobs
    /// keep going.
    pub async fn run(mut self, mut groups: mpsc::Receiver<ConfGroup>, cancel: CancellationToken) {
        info!("Job manager started");
        let mut open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some((key, generation, exit)) = self.exits_rx.recv() => {
                    self.on_exit(key, generation, exit);
                }
                Some((key, generation)) = self.overdue_rx.recv() => {
                    self.on_overdue(key, generation);
                }
                group = groups.recv(), if open => match group {
                    Some(group) => {
                        self.apply(group);
                        self.mark_ready();
                    }
                    None => {
                        debug!("Discovery finished sending config groups");
                        open = false;
                    }
                },
            }
        }

        self.shutdown().await;
    }

    pub(crate) fn apply(&mut self, group: ConfGroup) {
        self.metrics.inc_confgroups();
        let source = group.source;

        let mut accepted: Vec<JobConfig> = Vec::with_capacity(group.configs.len());
        for config in group.configs {
            let key = config.key();
            if !self.registry.contains(&config.module) {
                warn!(module = %config.module, job = %config.name, source = %source, "Unknown module, dropping job");
                continue;
            }
            if let Some(owner) = self.owners.get(&key) {
                if owner != &source {
                    warn!(job = %key, source = %source, owner = %owner, "Job already defined by another source, ignoring");
                    continue;
                }
            }
            if accepted.iter().any(|c| c.key() == key) {
                warn!(job = %key, source = %source, "Duplicate job in config group, ignoring");
                continue;
            }
            accepted.push(config);
        }

        let previous = self.sources.remove(&source).unwrap_or_default();
        let plan = diff(&previous, &accepted);
        if !plan.is_empty() {
            debug!(
                source = %source,
                start = plan.start.len(),
                stop = plan.stop.len(),
                restart = plan.restart.len(),
                "Applying config group"
            );
        }

        for key in &plan.stop {
            self.owners.remove(key);
            self.stop(key);
        }
        for config in plan.restart {
            info!(job = %config.key(), "Job config changed, restarting");
            self.start(config);
        }
        for config in plan.start {
            self.owners.insert(config.key(), source.clone());
            self.start(config);
        }

        if !accepted.is_empty() {
            self.sources
                .insert(source, accepted.into_iter().map(|c| (c.key(), c)).collect());
        }
    }

    /// Spawn a runner. A runner still alive for the same identity is
    /// cancelled and awaited by the new task before the job starts.
    fn start(&mut self, config: JobConfig) {
        let key = config.key();
        let Some(creator) = self.registry.get(&config.module) else {
            return;
        };
        let module = creator.create();

        self.generation += 1;
        let generation = self.generation;
        let previous = self.runners.remove(&key).map(|old| {
            old.cancel.cancel();
            old.handle
        });

        self.status.insert(
            key.clone(),
            JobStatus {
                module: config.module.clone(),
                name: config.name.clone(),
                source: config.source.clone(),
                state: JobState::Created,
                update_every: config.update_every,
                strikes: 0,
                last_error: None,
            },
        );

        // cleanup must finish early enough for the obsolete lines to go out
        let mut settings = self.settings.clone();
        settings.cleanup_timeout = settings.cleanup_timeout.min(self.grace / 2);

        let job = Job::new(config, module, self.factory.clone(), self.emitter.clone())
            .with_settings(settings)
            .with_status(self.status.clone());
        let cancel = CancellationToken::new();
        let exits = self.exits_tx.clone();
        let grace = self.grace;
        let task_key = key.clone();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            if let Some(mut old) = previous {
                if tokio::time::timeout(grace, &mut old).await.is_err() {
                    warn!(job = %task_key, "Previous runner did not stop in time, aborting it");
                    old.abort();
                }
            }
            let exit = job.run(task_cancel).await;
            let _ = exits.send((task_key, generation, exit));
        });

        debug!(job = %key, generation, "Job runner spawned");
        self.runners.insert(
            key,
            Runner {
                generation,
                cancel,
                handle,
            },
        );
    }

    /// Fire-and-forget stop; the exit arrives through the exit channel.
    /// A runner still alive after the grace period is aborted.
    fn stop(&mut self, key: &JobKey) {
        match self.runners.get(key) {
            Some(runner) => {
                info!(job = %key, "Stopping job");
                runner.cancel.cancel();

                let overdue = self.overdue_tx.clone();
                let grace = self.grace;
                let notice = (key.clone(), runner.generation);
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = overdue.send(notice);
                });
            }
            None => {
                // dead jobs have no runner left to report
                self.status.remove(key);
                self.update_dead_count();
            }
        }
    }

    fn on_exit(&mut self, key: JobKey, generation: u64, exit: JobExit) {
        match self.runners.get(&key) {
            Some(runner) if runner.generation == generation => {}
            _ => return,
        }
        self.runners.remove(&key);

        if !self.owners.contains_key(&key) {
            self.status.remove(&key);
        } else if exit == JobExit::Dead {
            info!(job = %key, "Job is dead until its config changes");
        }
        self.update_dead_count();
    }

    fn on_overdue(&mut self, key: JobKey, generation: u64) {
        match self.runners.get(&key) {
            Some(runner) if runner.generation == generation => {}
            _ => return,
        }
        if let Some(runner) = self.runners.remove(&key) {
            warn!(job = %key, "Job did not stop within the grace period, aborting");
            runner.handle.abort();
        }
        if !self.owners.contains_key(&key) {
            self.status.remove(&key);
        }
        self.update_dead_count();
    }

    fn update_dead_count(&self) {
        let dead = self
            .status
            .iter()
            .filter(|row| row.state == JobState::Dead)
            .count();
        self.metrics.set_jobs_dead(dead as i64);
    }

    fn mark_ready(&mut self) {
        if self.ready {
            return;
        }
        self.ready = true;
        if let Some(health) = &self.health {
            health.healthy(Component::JobManager);
            health.mark_configured();
        }
    }

    async fn shutdown(&mut self) {
        info!(jobs = self.runners.len(), "Stopping all jobs");
        for runner in self.runners.values() {
            runner.cancel.cancel();
        }

        let deadline = Instant::now() + self.grace;
        for (key, mut runner) in self.runners.drain() {
            if tokio::time::timeout_at(deadline, &mut runner.handle).await.is_err() {
                warn!(job = %key, "Job did not stop within the grace period, aborting");
                runner.handle.abort();
            }
        }
        info!("Job manager stopped");
    }
}
