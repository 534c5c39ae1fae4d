//! Message queue manager statistics over PCF
//!
//! Queues are listed every cycle and matched against the `queues` patterns.
//! Put/get counters are read from the queue status and fed through
//! [`MonotonicCounter`]s, so a server-side reset (our own
//! `reset_queue_stats` or an operator's) never shows as a negative rate.

use crate::clients::pcf::{
    MQCA_Q_MGR_NAME, MQCA_Q_NAME, MQIA_CURRENT_Q_DEPTH, MQIA_HIGH_Q_DEPTH, MQIA_MAX_Q_DEPTH,
    MQIA_MSG_DEQ_COUNT, MQIA_MSG_ENQ_COUNT,
};
use crate::clients::{Attributes, PcfClient, PcfConfig, PcfObject};
use crate::config::decode;
use crate::error::{CollectorError, Result};
use crate::module::{Base, Capabilities, Charts, JobContext, MetricBag, Module};
use async_trait::async_trait;
use glob::Pattern;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub mod contexts {
    crate::define_contexts! {
        QUEUE_DEPTH = {
            context: "mq.queue_depth",
            title: "Queue depth",
            units: "messages",
            family: "queues",
            chart_type: Line,
            priority: 1000,
            labels: ["queue"],
            dims: [("depth", Absolute, 1, 1), ("max_depth", Absolute, 1, 1)],
        };
        QUEUE_MESSAGES = {
            context: "mq.queue_messages",
            title: "Queue messages",
            units: "messages/s",
            family: "queues",
            chart_type: Line,
            priority: 1001,
            labels: ["queue"],
            dims: [("put_rate", Incremental, 1, 1), ("get_rate", Incremental, -1, 1)],
        };
        QUEUE_HIGH_DEPTH = {
            context: "mq.queue_high_depth",
            title: "Queue high depth since last reset",
            units: "messages",
            family: "queues",
            chart_type: Line,
            priority: 1002,
            labels: ["queue"],
            dims: [("high_depth", Absolute, 1, 1)],
        };
    }
}

const SYSTEM_PREFIX: &str = "SYSTEM.";

/// Running total over a counter the server may reset to zero.
///
/// A raw value below the previous one means the counter restarted; the raw
/// value is then the count since the restart.
#[derive(Debug, Default, Clone)]
pub struct MonotonicCounter {
    last: Option<i64>,
    total: i64,
}

impl MonotonicCounter {
    /// Feed the latest raw reading and return the running total
    pub fn update(&mut self, raw: i64) -> i64 {
        let delta = match self.last {
            Some(last) if raw >= last => raw - last,
            _ => raw.max(0),
        };
        self.last = Some(raw);
        self.total = self.total.saturating_add(delta);
        self.total
    }

    pub fn total(&self) -> i64 {
        self.total
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    put: MonotonicCounter,
    get: MonotonicCounter,
}

#[derive(Debug, Deserialize)]
struct Options {
    #[serde(flatten)]
    pcf: PcfConfig,
    #[serde(default = "default_queues", with = "decode::string_list")]
    queues: Vec<String>,
    #[serde(default)]
    include_system: bool,
    #[serde(default)]
    reset_queue_stats: bool,
}

fn default_queues() -> Vec<String> {
    vec!["*".to_string()]
}

/// One queue from the queue listing
#[derive(Debug, PartialEq)]
struct Queue {
    name: String,
    depth: Option<i64>,
    max_depth: Option<i64>,
}

impl Queue {
    fn from_attributes(attrs: &Attributes) -> Option<Self> {
        let name = attrs.get(&MQCA_Q_NAME)?.as_str()?.trim().to_string();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name,
            depth: attrs.get(&MQIA_CURRENT_Q_DEPTH).and_then(|v| v.as_i64()),
            max_depth: attrs.get(&MQIA_MAX_Q_DEPTH).and_then(|v| v.as_i64()),
        })
    }
}

pub struct Mq {
    base: Base,
    client: Option<Arc<dyn PcfClient>>,
    queue_manager: String,
    queues: Vec<Pattern>,
    include_system: bool,
    reset_queue_stats: bool,
    counters: HashMap<String, QueueCounters>,
    timeout: Option<Duration>,
}

impl Mq {
    pub fn new() -> Self {
        Self {
            base: Base::new("mq"),
            client: None,
            queue_manager: String::new(),
            queues: Vec::new(),
            include_system: false,
            reset_queue_stats: false,
            counters: HashMap::new(),
            timeout: None,
        }
    }

    fn client(&self) -> Result<Arc<dyn PcfClient>> {
        self.client
            .clone()
            .ok_or_else(|| CollectorError::internal("mq used before init"))
    }

    fn is_collected(&self, queue: &str) -> bool {
        if !self.include_system && queue.starts_with(SYSTEM_PREFIX) {
            return false;
        }
        self.queues.iter().any(|p| p.matches(queue))
    }

    async fn list_queues(&self, ctx: &JobContext) -> Result<Vec<Queue>> {
        let listing = self.client()?.inquire(ctx.cancel(), PcfObject::Queue, "*").await?;
        let mut queues: Vec<Queue> = listing
            .iter()
            .filter_map(Queue::from_attributes)
            .filter(|q| self.is_collected(&q.name))
            .collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }

    /// Cumulative put/get counters of one queue, if the server reports them
    async fn queue_status(&self, ctx: &JobContext, queue: &str) -> Result<Option<(i64, i64)>> {
        let status = self
            .client()?
            .inquire(ctx.cancel(), PcfObject::QueueStatus, queue)
            .await?;
        Ok(status.first().and_then(|attrs| {
            let put = attrs.get(&MQIA_MSG_ENQ_COUNT)?.as_i64()?;
            let get = attrs.get(&MQIA_MSG_DEQ_COUNT)?.as_i64()?;
            Some((put, get))
        }))
    }
}

impl Default for Mq {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for Mq {
    fn capabilities(&self) -> Capabilities {
        Capabilities::PCF
    }

    async fn init(&mut self, ctx: &JobContext) -> Result<()> {
        let opts: Options = ctx.options()?;
        opts.pcf.validate()?;
        self.queues = opts
            .queues
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| CollectorError::config(format!("invalid queue pattern '{p}': {e}")))
            })
            .collect::<Result<_>>()?;
        if self.queues.is_empty() {
            return Err(CollectorError::config("'queues' must not be empty"));
        }

        self.include_system = opts.include_system;
        self.reset_queue_stats = opts.reset_queue_stats;
        self.queue_manager = opts.pcf.queue_manager.clone();
        self.timeout = Some(opts.pcf.timeout);
        self.client = Some(ctx.clients().pcf(opts.pcf)?);
        self.base.set_update_every(ctx.config().update_every);
        Ok(())
    }

    async fn check(&mut self, ctx: &JobContext) -> Result<()> {
        let managers = self
            .client()?
            .inquire(ctx.cancel(), PcfObject::QueueManager, "*")
            .await?;
        let name = managers
            .first()
            .and_then(|attrs| attrs.get(&MQCA_Q_MGR_NAME))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .ok_or_else(|| CollectorError::protocol("queue manager inquiry returned no name"))?;
        if name != self.queue_manager {
            return Err(CollectorError::config(format!(
                "connected to queue manager '{name}', expected '{}'",
                self.queue_manager
            )));
        }
        info!(queue_manager = %name, "Connected to queue manager");
        Ok(())
    }

    fn charts(&self) -> Charts {
        Charts::new()
    }

    async fn collect(&mut self, ctx: &JobContext, charts: &mut Charts) -> Result<MetricBag> {
        use self::contexts::{QUEUE_DEPTH, QUEUE_HIGH_DEPTH, QUEUE_MESSAGES};

        let queues = self.list_queues(ctx).await?;
        let client = self.client()?;

        self.base.begin_cycle();
        let mut bag = MetricBag::new();
        for queue in &queues {
            let labels = [("queue", queue.name.as_str())];

            if let (Some(depth), Some(max_depth)) = (queue.depth, queue.max_depth) {
                let chart_id = crate::contexts::set(
                    charts,
                    &mut bag,
                    &QUEUE_DEPTH,
                    &labels,
                    &[("depth", depth), ("max_depth", max_depth)],
                )?;
                self.base.mark_seen(&chart_id);
            }

            if let Some((put, get)) = self.queue_status(ctx, &queue.name).await? {
                let counters = self.counters.entry(queue.name.clone()).or_default();
                let values = [("put_rate", counters.put.update(put)), ("get_rate", counters.get.update(get))];
                let chart_id = crate::contexts::set(charts, &mut bag, &QUEUE_MESSAGES, &labels, &values)?;
                self.base.mark_seen(&chart_id);
            }

            if self.reset_queue_stats {
                let stats = client.reset_queue_stats(ctx.cancel(), &queue.name).await?;
                if let Some(high) = stats.get(&MQIA_HIGH_Q_DEPTH).and_then(|v| v.as_i64()) {
                    let chart_id = crate::contexts::set(
                        charts,
                        &mut bag,
                        &QUEUE_HIGH_DEPTH,
                        &labels,
                        &[("high_depth", high)],
                    )?;
                    self.base.mark_seen(&chart_id);
                }
            }
        }

        for chart_id in self.base.take_vanished() {
            debug!(chart = %chart_id, "Queue vanished");
            if charts.contains(&chart_id) {
                charts
                    .mark_obsolete(&chart_id)
                    .map_err(|e| CollectorError::internal(e.to_string()))?;
            }
        }
        self.counters
            .retain(|name, _| queues.iter().any(|q| &q.name == name));

        Ok(bag)
    }

    async fn cleanup(&mut self, _ctx: &JobContext) {
        if let Some(client) = self.client.take() {
            client.close().await;
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ClientFactory, PcfValue};
    use crate::confgroup::JobConfig;
    use crate::job::ChartTracker;
    use crate::modules::testing;
    use crate::output::ApiWriter;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    fn attrs(pairs: &[(i32, PcfValue)]) -> Attributes {
        pairs.iter().cloned().collect()
    }

    /// Queue manager QM1 with one application queue and one system queue.
    /// Status readings of DEV.QUEUE.1 are scripted; the last one repeats.
    struct QueueManager {
        queues: Mutex<Vec<&'static str>>,
        status: Mutex<VecDeque<(i64, i64)>>,
        resets: Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    impl QueueManager {
        fn new(status: &[(i64, i64)]) -> Arc<Self> {
            Arc::new(Self {
                queues: Mutex::new(vec!["DEV.QUEUE.1                                     ", "SYSTEM.ADMIN.COMMAND.QUEUE"]),
                status: Mutex::new(status.iter().copied().collect()),
                resets: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl PcfClient for QueueManager {
        async fn inquire(
            &self,
            _cancel: &CancellationToken,
            object: PcfObject,
            filter: &str,
        ) -> Result<Vec<Attributes>> {
            Ok(match object {
                PcfObject::QueueManager => vec![attrs(&[(MQCA_Q_MGR_NAME, PcfValue::Str("QM1 ".into()))])],
                PcfObject::Queue => self
                    .queues
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|name| {
                        attrs(&[
                            (MQCA_Q_NAME, PcfValue::Str((*name).into())),
                            (MQIA_CURRENT_Q_DEPTH, PcfValue::Int(3)),
                            (MQIA_MAX_Q_DEPTH, PcfValue::Int(5000)),
                        ])
                    })
                    .collect(),
                PcfObject::QueueStatus => {
                    assert_eq!(filter, "DEV.QUEUE.1");
                    let mut status = self.status.lock().unwrap();
                    let (put, get) = if status.len() > 1 {
                        status.pop_front().unwrap()
                    } else {
                        status[0]
                    };
                    vec![attrs(&[
                        (MQIA_MSG_ENQ_COUNT, PcfValue::Int64(put)),
                        (MQIA_MSG_DEQ_COUNT, PcfValue::Int64(get)),
                    ])]
                }
                PcfObject::Channel => Vec::new(),
            })
        }

        async fn reset_queue_stats(&self, _cancel: &CancellationToken, queue: &str) -> Result<Attributes> {
            self.resets.lock().unwrap().push(queue.to_string());
            Ok(attrs(&[(MQIA_HIGH_Q_DEPTH, PcfValue::Int(7))]))
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeFactory(Arc<QueueManager>);

    impl ClientFactory for FakeFactory {
        fn pcf(&self, _config: PcfConfig) -> Result<Arc<dyn PcfClient>> {
            Ok(self.0.clone())
        }
    }

    fn config() -> JobConfig {
        JobConfig::new("mq", "qm1")
            .with_option("queue_manager", "QM1")
            .with_option("connection_name", "mq.local(1414)")
    }

    async fn ready(qm: &Arc<QueueManager>, config: JobConfig) -> (Mq, JobContext) {
        let mut module = Mq::new();
        let ctx = testing::context(&module, config, Arc::new(FakeFactory(qm.clone())));
        module.init(&ctx).await.unwrap();
        module.check(&ctx).await.unwrap();
        (module, ctx)
    }

    #[test]
    fn test_monotonic_counter() {
        let mut c = MonotonicCounter::default();
        assert_eq!(c.update(100), 100);
        assert_eq!(c.update(150), 150);
        // reset: the new reading counts from zero
        assert_eq!(c.update(20), 170);
        assert_eq!(c.update(20), 170);
        assert_eq!(c.update(-5), 170);
        assert_eq!(c.total(), 170);
    }

    #[tokio::test]
    async fn test_init_requires_queue_manager() {
        let qm = QueueManager::new(&[(0, 0)]);
        let mut module = Mq::new();
        let config = JobConfig::new("mq", "qm1")
            .with_option("queue_manager", "")
            .with_option("connection_name", "mq.local(1414)");
        let ctx = testing::context(&module, config, Arc::new(FakeFactory(qm)));
        assert!(matches!(module.init(&ctx).await, Err(CollectorError::Config(_))));
    }

    #[tokio::test]
    async fn test_check_rejects_other_queue_manager() {
        let qm = QueueManager::new(&[(0, 0)]);
        let mut module = Mq::new();
        let config = config().with_option("queue_manager", "QM2");
        let ctx = testing::context(&module, config, Arc::new(FakeFactory(qm)));
        module.init(&ctx).await.unwrap();
        assert!(matches!(module.check(&ctx).await, Err(CollectorError::Config(_))));
    }

    #[tokio::test]
    async fn test_system_queues_are_skipped() {
        let qm = QueueManager::new(&[(10, 5)]);
        let (mut module, ctx) = ready(&qm, config()).await;

        let mut charts = testing::declared(&module);
        let bag = module.collect(&ctx, &mut charts).await.unwrap();
        assert_eq!(bag.get("dev_queue_1_depth"), Some(3));
        assert_eq!(bag.get("dev_queue_1_max_depth"), Some(5000));
        assert_eq!(bag.get("dev_queue_1_put_rate"), Some(10));
        assert!(charts.iter().all(|c| !c.id.contains("system")));
        // no reset unless asked for
        assert!(qm.resets.lock().unwrap().is_empty());
        assert!(!bag.contains("dev_queue_1_high_depth"));
    }

    #[tokio::test]
    async fn test_reset_never_produces_negative_rate() {
        let qm = QueueManager::new(&[(100, 50), (0, 50), (30, 80)]);
        let (mut module, ctx) = ready(&qm, config().with_option("reset_queue_stats", true)).await;

        let mut tracker = ChartTracker::new(ctx.config(), 10);
        let mut charts = testing::declared(&module);
        let mut readings = Vec::new();
        for _ in 0..3 {
            let bag = module.collect(&ctx, &mut charts).await.unwrap();
            let mut out = ApiWriter::new();
            tracker.cycle(&mut charts, &bag, &mut out);
            assert!(out.as_str().contains("BEGIN 'mq.queue_messages_dev_queue_1_qm1'"));
            readings.push((
                bag.get("dev_queue_1_put_rate").unwrap(),
                bag.get("dev_queue_1_get_rate").unwrap(),
                bag.get("dev_queue_1_high_depth").unwrap(),
            ));
        }

        assert_eq!(readings, vec![(100, 50, 7), (100, 50, 7), (130, 80, 7)]);
        // the incremental put dimension sees no change across the reset
        assert_eq!(readings[1].0 - readings[0].0, 0);
        assert_eq!(*qm.resets.lock().unwrap(), vec!["DEV.QUEUE.1"; 3]);
    }

    #[tokio::test]
    async fn test_vanished_queue_is_obsoleted() {
        let qm = QueueManager::new(&[(1, 1)]);
        let (mut module, ctx) = ready(&qm, config()).await;
        let mut charts = testing::declared(&module);

        module.collect(&ctx, &mut charts).await.unwrap();
        assert!(charts.contains("queue_depth_dev_queue_1"));

        qm.queues.lock().unwrap().retain(|q| q.starts_with("SYSTEM"));
        let bag = module.collect(&ctx, &mut charts).await.unwrap();
        assert!(bag.is_empty());
        assert!(charts.get("queue_depth_dev_queue_1").unwrap().is_obsolete());
        assert!(charts.get("queue_messages_dev_queue_1").unwrap().is_obsolete());
    }

    #[tokio::test]
    async fn test_cleanup_closes_client() {
        let qm = QueueManager::new(&[(1, 1)]);
        let (mut module, ctx) = ready(&qm, config()).await;
        module.cleanup(&ctx).await;
        assert!(qm.closed.load(Ordering::SeqCst));
    }
}
