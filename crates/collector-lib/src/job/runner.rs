//! Per-job scheduling loop

use super::tracker::ChartTracker;
use super::{JobState, StatusTable};
use crate::clients::{ClientFactory, ClientSet};
use crate::confgroup::{JobConfig, JobKey};
use crate::error::{CollectorError, Result};
use crate::module::{Charts, JobContext, MetricBag, Module};
use crate::observability::{RuntimeMetrics, StructuredLogger};
use crate::output::{ApiWriter, Emitter};
use futures::FutureExt;
use rand::Rng;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive failed collections that send a job back to check
pub const STRIKE_THRESHOLD: u32 = 3;

/// Tunables shared by all jobs
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub strike_threshold: u32,
    /// Upper bound of the first-tick delay, as a fraction of the interval
    pub max_jitter: f64,
    /// Update intervals without data before a chart is obsoleted
    pub obsolete_after_cycles: u64,
    /// Longest a module's cleanup may run before its charts are obsoleted anyway
    pub cleanup_timeout: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            strike_threshold: STRIKE_THRESHOLD,
            max_jitter: 0.1,
            obsolete_after_cycles: 10,
            cleanup_timeout: Duration::from_secs(2),
        }
    }
}

/// How a runner ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobExit {
    Stopped,
    Dead,
}

enum Phase {
    Check,
    Collect,
    Stop,
    Dead(CollectorError),
}

/// One module instance and everything needed to drive it
pub struct Job {
    config: JobConfig,
    module: Box<dyn Module>,
    factory: Arc<dyn ClientFactory>,
    emitter: Arc<Emitter>,
    settings: JobSettings,
    charts: Charts,
    tracker: ChartTracker,
    announced: bool,
    status: Option<StatusTable>,
    metrics: RuntimeMetrics,
    logger: StructuredLogger,
}

impl Job {
    pub fn new(
        config: JobConfig,
        module: Box<dyn Module>,
        factory: Arc<dyn ClientFactory>,
        emitter: Arc<Emitter>,
    ) -> Self {
        let settings = JobSettings::default();
        let tracker = ChartTracker::new(&config, settings.obsolete_after_cycles);
        Self {
            config,
            module,
            factory,
            emitter,
            settings,
            charts: Charts::new(),
            tracker,
            announced: false,
            status: None,
            metrics: RuntimeMetrics::new(),
            logger: StructuredLogger::new("collector"),
        }
    }

    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.tracker = ChartTracker::new(&self.config, settings.obsolete_after_cycles);
        self.settings = settings;
        self
    }

    pub fn with_status(mut self, status: StatusTable) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn key(&self) -> JobKey {
        self.config.key()
    }

    /// Drive the job until `cancel` fires or it dies
    pub async fn run(mut self, cancel: CancellationToken) -> JobExit {
        let clients = ClientSet::new(
            self.factory.clone(),
            self.module.capabilities(),
            self.config.module.clone(),
        );
        let ctx = JobContext::new(self.config.clone(), cancel.clone(), clients);
        let module_name = self.config.module.clone();
        let job_name = self.config.name.clone();

        self.metrics.job_started();
        self.report(JobState::Initialising, 0, None);

        let setup_deadline = self.collect_deadline(self.config.update_interval());
        let init = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CollectorError::Cancelled),
            res = timeout(setup_deadline, guarded(self.module.init(&ctx))) => {
                res.unwrap_or(Err(CollectorError::Timeout(setup_deadline)))
            }
        };

        let mut phase = match init {
            Ok(()) => Phase::Check,
            Err(CollectorError::Cancelled) => Phase::Stop,
            Err(err) => Phase::Dead(err),
        };

        loop {
            phase = match phase {
                Phase::Check => self.check(&ctx).await,
                Phase::Collect => self.collect_loop(&ctx).await,
                Phase::Stop => {
                    self.teardown(&ctx).await;
                    self.report(JobState::Stopped, 0, None);
                    self.metrics.job_stopped();
                    self.logger.log_job_stopped(&module_name, &job_name, "stopped");
                    return JobExit::Stopped;
                }
                Phase::Dead(err) => {
                    self.teardown(&ctx).await;
                    self.report(JobState::Dead, 0, Some(&err));
                    self.metrics.job_stopped();
                    self.logger.log_job_dead(&module_name, &job_name, &err.to_string());
                    return JobExit::Dead;
                }
            };
        }
    }

    /// Check with retries, then announce. Each attempt gets the collect deadline.
    async fn check(&mut self, ctx: &JobContext) -> Phase {
        let interval = self.config.update_interval();
        let deadline = self.collect_deadline(interval);
        let mut retries = 0;

        loop {
            let res = tokio::select! {
                biased;
                _ = ctx.cancel().cancelled() => return Phase::Stop,
                res = timeout(deadline, guarded(self.module.check(ctx))) => {
                    res.unwrap_or(Err(CollectorError::Timeout(deadline)))
                }
            };

            match res {
                Ok(()) => break,
                Err(CollectorError::Cancelled) => return Phase::Stop,
                Err(err) if err.is_retryable() && retries < self.config.autodetection_retry => {
                    retries += 1;
                    debug!(
                        module = %self.config.module,
                        job = %self.config.name,
                        retry = retries,
                        error = %err,
                        "Check failed, retrying"
                    );
                    self.report(JobState::CheckRetrying, 0, Some(&err));
                    tokio::select! {
                        biased;
                        _ = ctx.cancel().cancelled() => return Phase::Stop,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                Err(err) => return Phase::Dead(err),
            }
        }

        if !self.announced {
            for chart in self.module.charts() {
                if let Err(err) = self.charts.add(chart) {
                    warn!(module = %self.config.module, job = %self.config.name, error = %err, "Rejected chart");
                }
            }
        }

        let mut out = ApiWriter::new();
        self.tracker.announce(&mut self.charts, &mut out);
        if self.emitter.emit(out.as_str()).is_err() {
            return Phase::Stop;
        }

        if !self.announced {
            self.announced = true;
            self.logger
                .log_job_started(&self.config.module, &self.config.name, self.config.update_every);
        } else {
            info!(module = %self.config.module, job = %self.config.name, "Job recovered");
        }
        Phase::Collect
    }

    /// Per-collection deadline: the module's own timeout, capped by the
    /// interval minus a safety margin
    fn collect_deadline(&self, interval: Duration) -> Duration {
        let cap = interval.saturating_sub(interval / 20);
        match self.module.timeout() {
            Some(timeout) if !timeout.is_zero() => timeout.min(cap),
            _ => cap,
        }
    }

    async fn collect_loop(&mut self, ctx: &JobContext) -> Phase {
        let interval = self.config.update_interval();
        let deadline = self.collect_deadline(interval);
        let jitter = interval.mul_f64(rand::thread_rng().gen_range(0.0..=self.settings.max_jitter));

        let mut ticker = interval_at(Instant::now() + jitter, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.report(JobState::Running, 0, None);

        let mut strikes = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel().cancelled() => return Phase::Stop,
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            let res = tokio::select! {
                biased;
                _ = ctx.cancel().cancelled() => return Phase::Stop,
                res = timeout(deadline, guarded(self.module.collect(ctx, &mut self.charts))) => {
                    res.unwrap_or(Err(CollectorError::Timeout(deadline)))
                }
            };
            self.metrics.observe_collection_latency(started.elapsed());

            match res {
                Ok(bag) => {
                    if strikes > 0 {
                        self.report(JobState::Running, 0, None);
                    }
                    strikes = 0;
                    if self.publish(&bag).is_err() {
                        return Phase::Stop;
                    }
                }
                Err(CollectorError::Cancelled) => return Phase::Stop,
                Err(err) => {
                    strikes += 1;
                    let kind = err.kind();
                    self.metrics.inc_strike(kind.as_str());
                    self.logger.log_strike(
                        &self.config.module,
                        &self.config.name,
                        strikes,
                        kind.as_str(),
                        &err.to_string(),
                    );
                    self.report(JobState::Running, strikes, Some(&err));
                    if strikes >= self.settings.strike_threshold {
                        warn!(
                            module = %self.config.module,
                            job = %self.config.name,
                            strikes,
                            "Too many failed collections, re-checking"
                        );
                        return Phase::Check;
                    }
                }
            }
        }
    }

    fn publish(&mut self, bag: &MetricBag) -> Result<()> {
        let mut out = ApiWriter::new();
        self.tracker.cycle(&mut self.charts, bag, &mut out);
        self.emitter.emit(out.as_str())
    }

    /// Release the module and obsolete everything the parent still draws.
    /// A cleanup that overruns `cleanup_timeout` is abandoned.
    async fn teardown(&mut self, ctx: &JobContext) {
        let limit = self.settings.cleanup_timeout;
        let cleanup = timeout(
            limit,
            guarded(async {
                self.module.cleanup(ctx).await;
                Ok(())
            }),
        )
        .await
        .unwrap_or(Err(CollectorError::Timeout(limit)));
        if let Err(err) = cleanup {
            warn!(module = %self.config.module, job = %self.config.name, error = %err, "Cleanup failed");
        }

        let mut out = ApiWriter::new();
        self.tracker.obsolete_all(&mut out);
        let _ = self.emitter.emit(out.as_str());
    }

    fn report(&self, state: JobState, strikes: u32, error: Option<&CollectorError>) {
        let Some(status) = &self.status else {
            return;
        };
        if let Some(mut row) = status.get_mut(&self.config.key()) {
            row.state = state;
            row.strikes = strikes;
            if let Some(err) = error {
                row.last_error = Some(err.to_string());
            }
        }
    }
}

/// Run a module call, turning a panic into an internal error
async fn guarded<T>(fut: impl Future<Output = Result<T>>) -> Result<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(res) => res,
        Err(panic) => Err(CollectorError::internal(format!(
            "module panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
