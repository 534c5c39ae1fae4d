//! Self-telemetry for the collector runtime
//!
//! Provides:
//! - Prometheus metrics (running/dead jobs, collection latency, strikes, output volume)
//! - Structured lifecycle logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for collection latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static GLOBAL_METRICS: OnceLock<RuntimeMetricsInner> = OnceLock::new();

struct RuntimeMetricsInner {
    jobs_running: IntGauge,
    jobs_dead: IntGauge,
    collection_latency_seconds: Histogram,
    collection_strikes: IntCounterVec,
    emitted_bytes: IntCounter,
    confgroups_received: IntCounter,
}

impl RuntimeMetricsInner {
    fn new() -> Self {
        Self {
            jobs_running: register_int_gauge!(
                "collector_jobs_running",
                "Number of jobs currently collecting"
            )
            .expect("Failed to register jobs_running"),

            jobs_dead: register_int_gauge!(
                "collector_jobs_dead",
                "Number of jobs that gave up after failed checks"
            )
            .expect("Failed to register jobs_dead"),

            collection_latency_seconds: register_histogram!(
                "collector_collection_latency_seconds",
                "Time spent in a single module collection",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register collection_latency_seconds"),

            collection_strikes: register_int_counter_vec!(
                "collector_collection_strikes_total",
                "Failed collections by error kind",
                &["kind"]
            )
            .expect("Failed to register collection_strikes"),

            emitted_bytes: register_int_counter!(
                "collector_emitted_bytes_total",
                "Bytes written to the parent"
            )
            .expect("Failed to register emitted_bytes"),

            confgroups_received: register_int_counter!(
                "collector_confgroups_received_total",
                "Configuration groups received from discovery"
            )
            .expect("Failed to register confgroups_received"),
        }
    }
}

/// Handle to the process-wide runtime metrics.
///
/// Clones share the same underlying collectors.
#[derive(Clone)]
pub struct RuntimeMetrics {
    _private: (),
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(RuntimeMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &RuntimeMetricsInner {
        GLOBAL_METRICS.get_or_init(RuntimeMetricsInner::new)
    }

    pub fn job_started(&self) {
        self.inner().jobs_running.inc();
    }

    pub fn job_stopped(&self) {
        self.inner().jobs_running.dec();
    }

    pub fn set_jobs_dead(&self, count: i64) {
        self.inner().jobs_dead.set(count);
    }

    pub fn observe_collection_latency(&self, elapsed: Duration) {
        self.inner()
            .collection_latency_seconds
            .observe(elapsed.as_secs_f64());
    }

    pub fn inc_strike(&self, kind: &str) {
        self.inner()
            .collection_strikes
            .with_label_values(&[kind])
            .inc();
    }

    pub fn add_emitted_bytes(&self, bytes: u64) {
        self.inner().emitted_bytes.inc_by(bytes);
    }

    pub fn inc_confgroups(&self) {
        self.inner().confgroups_received.inc();
    }
}

/// Structured logger for job lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_job_started(&self, module: &str, job: &str, update_every: u64) {
        info!(
            event = "job_started",
            instance = %self.instance,
            module = %module,
            job = %job,
            update_every = update_every,
            "Job started"
        );
    }

    pub fn log_job_stopped(&self, module: &str, job: &str, reason: &str) {
        info!(
            event = "job_stopped",
            instance = %self.instance,
            module = %module,
            job = %job,
            reason = %reason,
            "Job stopped"
        );
    }

    pub fn log_job_dead(&self, module: &str, job: &str, error: &str) {
        warn!(
            event = "job_dead",
            instance = %self.instance,
            module = %module,
            job = %job,
            error = %error,
            "Job gave up"
        );
    }

    pub fn log_strike(&self, module: &str, job: &str, strikes: u32, kind: &str, error: &str) {
        warn!(
            event = "job_strike",
            instance = %self.instance,
            module = %module,
            job = %job,
            strikes = strikes,
            kind = %kind,
            error = %error,
            "Collection failed"
        );
    }

    pub fn log_startup(&self, version: &str, modules: usize) {
        info!(
            event = "runtime_started",
            instance = %self.instance,
            version = %version,
            modules = modules,
            "Collector runtime started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "runtime_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Collector runtime shutting down"
        );
    }
}
