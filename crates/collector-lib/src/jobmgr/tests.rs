use super::*;
use crate::clients::DefaultClients;
use crate::confgroup::ConfGroup;
use crate::error::{CollectorError, Result};
use crate::job::{JobState, StatusTable};
use crate::module::{Chart, Charts, Dim, JobContext, MetricBag, Module};
use crate::output::testing::SharedBuffer;
use crate::output::Emitter;
use crate::registry::{Creator, Registry};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Reports a constant; a job with the `dead` option fails its check for good
struct Constant;

#[async_trait]
impl Module for Constant {
    async fn init(&mut self, _ctx: &JobContext) -> Result<()> {
        Ok(())
    }

    async fn check(&mut self, ctx: &JobContext) -> Result<()> {
        if ctx.config().options.contains_key("dead") {
            return Err(CollectorError::Auth("denied".into()));
        }
        Ok(())
    }

    fn charts(&self) -> Charts {
        let mut charts = Charts::new();
        let _ = charts.add(Chart::new("up", "Up", "boolean").with_dim(Dim::new("up")));
        charts
    }

    async fn collect(&mut self, _ctx: &JobContext, _charts: &mut Charts) -> Result<MetricBag> {
        let mut bag = MetricBag::new();
        bag.set("up", 1);
        Ok(bag)
    }
}

fn job(name: &str) -> JobConfig {
    let mut config = JobConfig::new("constant", name);
    config.source = "file=/etc/collector/constant.yaml".into();
    config
}

struct Harness {
    created: Arc<AtomicUsize>,
    buf: SharedBuffer,
    status: StatusTable,
    groups: mpsc::Sender<ConfGroup>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

fn harness() -> Harness {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = created.clone();
    let mut registry = Registry::new();
    registry
        .register(
            "constant",
            Creator::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Constant
            }),
        )
        .unwrap();

    let buf = SharedBuffer::default();
    let emitter = Arc::new(Emitter::new(Box::new(buf.clone()), CancellationToken::new()));
    let manager = JobManager::new(Arc::new(registry), Arc::new(DefaultClients), emitter)
        .with_grace(Duration::from_secs(1));
    let status = manager.status();

    let (groups, rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(manager.run(rx, cancel.clone()));

    Harness {
        created,
        buf,
        status,
        groups,
        cancel,
        handle,
    }
}

impl Harness {
    async fn send(&self, group: ConfGroup) {
        self.groups.send(group).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    fn state(&self, name: &str) -> Option<JobState> {
        self.status
            .get(&JobKey::new("constant", name))
            .map(|row| row.state)
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[test]
fn test_diff() {
    let previous: HashMap<JobKey, JobConfig> = [job("a"), job("b"), job("c")]
        .into_iter()
        .map(|c| (c.key(), c))
        .collect();
    let changed = job("b").with_option("url", "http://127.0.0.1:8080");

    let plan = diff(&previous, &[job("a"), changed.clone(), job("d")]);
    assert_eq!(plan.start, vec![job("d")]);
    assert_eq!(plan.restart, vec![changed]);
    assert_eq!(plan.stop, vec![JobKey::new("constant", "c")]);
}

#[test]
fn test_diff_is_idempotent() {
    let next = vec![job("a"), job("b")];
    let plan = diff(&HashMap::new(), &next);
    assert_eq!(plan.start.len(), 2);

    let applied: HashMap<JobKey, JobConfig> = next.iter().map(|c| (c.key(), c.clone())).collect();
    assert!(diff(&applied, &next).is_empty());
}

#[test]
fn test_diff_empty_group_stops_everything() {
    let previous: HashMap<JobKey, JobConfig> =
        [job("a"), job("b")].into_iter().map(|c| (c.key(), c)).collect();
    let plan = diff(&previous, &[]);
    assert!(plan.start.is_empty());
    assert_eq!(plan.stop.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_start_and_replay() {
    let mut h = harness();
    let group = ConfGroup::new("file=a.yaml", vec![job("one"), job("two")]);

    h.send(group.clone()).await;
    assert_eq!(h.state("one"), Some(JobState::Running));
    assert_eq!(h.state("two"), Some(JobState::Running));
    assert_eq!(h.created(), 2);

    // identical replay is a no-op
    h.send(group).await;
    assert_eq!(h.created(), 2);

    h.cancel.cancel();
    (&mut h.handle).await.unwrap();
    assert_eq!(h.state("one"), Some(JobState::Stopped));
}

#[tokio::test(start_paused = true)]
async fn test_removed_job_is_stopped_and_obsoleted() {
    let h = harness();
    h.send(ConfGroup::new("file=a.yaml", vec![job("one"), job("two")]))
        .await;
    h.send(ConfGroup::new("file=a.yaml", vec![job("one")])).await;

    assert_eq!(h.state("one"), Some(JobState::Running));
    assert_eq!(h.state("two"), None);
    let lines = h.buf.lines();
    assert!(lines
        .iter()
        .any(|l| l.starts_with("CHART 'constant.up_two'") && l.contains("'obsolete'")));
    assert!(!lines
        .iter()
        .any(|l| l.starts_with("CHART 'constant.up_one'") && l.contains("'obsolete'")));

    // an empty group removes the rest of the source
    h.send(ConfGroup::empty("file=a.yaml")).await;
    assert!(h.status.is_empty());

    h.cancel.cancel();
    h.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unknown_module_is_dropped() {
    let h = harness();
    h.send(ConfGroup::new(
        "file=a.yaml",
        vec![JobConfig::new("nonexistent", "x"), job("one")],
    ))
    .await;

    assert_eq!(h.status.len(), 1);
    assert_eq!(h.state("one"), Some(JobState::Running));

    h.cancel.cancel();
    h.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_first_source_owns_the_job() {
    let h = harness();
    h.send(ConfGroup::new("file=a.yaml", vec![job("one")])).await;
    h.send(ConfGroup::new(
        "file=b.yaml",
        vec![job("one").with_option("url", "http://other")],
    ))
    .await;
    assert_eq!(h.created(), 1);

    // the second source never owned it, so dropping that source keeps it
    h.send(ConfGroup::empty("file=b.yaml")).await;
    assert_eq!(h.state("one"), Some(JobState::Running));

    h.cancel.cancel();
    h.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_restart_obsoletes_before_reannounce() {
    let h = harness();
    h.send(ConfGroup::new("file=a.yaml", vec![job("one")])).await;
    h.send(ConfGroup::new(
        "file=a.yaml",
        vec![job("one").with_option("url", "http://changed")],
    ))
    .await;

    assert_eq!(h.created(), 2);
    assert_eq!(h.state("one"), Some(JobState::Running));

    let charts: Vec<String> = h
        .buf
        .lines()
        .into_iter()
        .filter(|l| l.starts_with("CHART 'constant.up_one'"))
        .collect();
    assert_eq!(charts.len(), 3);
    assert!(!charts[0].contains("'obsolete'"));
    assert!(charts[1].contains("'obsolete'"));
    assert!(!charts[2].contains("'obsolete'"));

    h.cancel.cancel();
    h.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dead_job_restarts_only_on_change() {
    let h = harness();
    let dead = job("one").with_option("dead", true);

    h.send(ConfGroup::new("file=a.yaml", vec![dead.clone()])).await;
    assert_eq!(h.state("one"), Some(JobState::Dead));

    h.send(ConfGroup::new("file=a.yaml", vec![dead])).await;
    assert_eq!(h.created(), 1);
    assert_eq!(h.state("one"), Some(JobState::Dead));

    h.send(ConfGroup::new("file=a.yaml", vec![job("one")])).await;
    assert_eq!(h.created(), 2);
    assert_eq!(h.state("one"), Some(JobState::Running));

    h.cancel.cancel();
    h.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_jobs_keep_running_after_discovery_finishes() {
    let h = harness();
    h.send(ConfGroup::new("file=a.yaml", vec![job("one")])).await;
    let Harness {
        groups,
        status,
        cancel,
        handle,
        ..
    } = h;
    drop(groups);
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(
        status.get(&JobKey::new("constant", "one")).map(|r| r.state),
        Some(JobState::Running)
    );
    cancel.cancel();
    handle.await.unwrap();
}

/// Like `Constant`, but its cleanup never returns
struct StuckCleanup;

#[async_trait]
impl Module for StuckCleanup {
    async fn init(&mut self, _ctx: &JobContext) -> Result<()> {
        Ok(())
    }

    async fn check(&mut self, _ctx: &JobContext) -> Result<()> {
        Ok(())
    }

    fn charts(&self) -> Charts {
        Constant.charts()
    }

    async fn collect(&mut self, ctx: &JobContext, charts: &mut Charts) -> Result<MetricBag> {
        Constant.collect(ctx, charts).await
    }

    async fn cleanup(&mut self, _ctx: &JobContext) {
        std::future::pending::<()>().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_removed_job_with_stuck_cleanup_is_released() {
    let mut registry = Registry::new();
    registry.register("stuck", Creator::new(|| StuckCleanup)).unwrap();

    let buf = SharedBuffer::default();
    let emitter = Arc::new(Emitter::new(Box::new(buf.clone()), CancellationToken::new()));
    let manager = JobManager::new(Arc::new(registry), Arc::new(DefaultClients), emitter)
        .with_grace(Duration::from_secs(1));
    let status = manager.status();

    let (groups, rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(manager.run(rx, cancel.clone()));

    groups
        .send(ConfGroup::new("file=stuck.yaml", vec![JobConfig::new("stuck", "one")]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        status.get(&JobKey::new("stuck", "one")).map(|r| r.state),
        Some(JobState::Running)
    );

    groups.send(ConfGroup::empty("file=stuck.yaml")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(status.is_empty());
    let lines = buf.lines();
    assert!(lines.last().unwrap().starts_with("CHART 'stuck.up_one'"));
    assert!(lines.last().unwrap().contains("'obsolete'"));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("manager must stop")
        .unwrap();
}
