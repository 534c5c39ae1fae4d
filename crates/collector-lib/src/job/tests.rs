use super::*;
use crate::clients::DefaultClients;
use crate::confgroup::JobConfig;
use crate::error::{CollectorError, Result};
use crate::module::{Chart, Charts, Dim, JobContext, MetricBag, Module};
use crate::output::testing::SharedBuffer;
use crate::output::Emitter;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Calls {
    init: usize,
    check: usize,
    collect: usize,
    cleanup: usize,
}

enum Step {
    Fail(CollectorError),
    Hang,
    Panic,
}

/// Module whose check/collect outcomes are scripted; collects succeed once
/// the script runs out.
#[derive(Default)]
struct Scripted {
    init_error: Option<CollectorError>,
    checks: VecDeque<Result<()>>,
    collects: VecDeque<Step>,
    timeout: Option<Duration>,
    hang_check: bool,
    hang_cleanup: bool,
    calls: Arc<Mutex<Calls>>,
}

impl Scripted {
    fn calls(&self) -> Arc<Mutex<Calls>> {
        self.calls.clone()
    }
}

#[async_trait]
impl Module for Scripted {
    async fn init(&mut self, _ctx: &JobContext) -> Result<()> {
        self.calls.lock().unwrap().init += 1;
        match self.init_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn check(&mut self, _ctx: &JobContext) -> Result<()> {
        self.calls.lock().unwrap().check += 1;
        if self.hang_check {
            std::future::pending::<()>().await;
        }
        self.checks.pop_front().unwrap_or(Ok(()))
    }

    fn charts(&self) -> Charts {
        let mut charts = Charts::new();
        charts
            .add(Chart::new("load", "Load", "units").with_dim(Dim::new("value")))
            .unwrap();
        charts
    }

    async fn collect(&mut self, _ctx: &JobContext, _charts: &mut Charts) -> Result<MetricBag> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.collect += 1;
            calls.collect
        };
        match self.collects.pop_front() {
            None => {
                let mut bag = MetricBag::new();
                bag.set("value", n as i64);
                Ok(bag)
            }
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Some(Step::Panic) => panic!("collector exploded"),
        }
    }

    async fn cleanup(&mut self, _ctx: &JobContext) {
        self.calls.lock().unwrap().cleanup += 1;
        if self.hang_cleanup {
            std::future::pending::<()>().await;
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

fn config(update_every: u64, autodetection_retry: u64) -> JobConfig {
    let mut config = JobConfig::new("fake", "job");
    config.update_every = update_every;
    config.autodetection_retry = autodetection_retry;
    config
}

struct Running {
    buf: SharedBuffer,
    cancel: CancellationToken,
    handle: JoinHandle<JobExit>,
}

fn start(config: JobConfig, module: Scripted, status: Option<StatusTable>) -> Running {
    let buf = SharedBuffer::default();
    let emitter = Arc::new(Emitter::new(Box::new(buf.clone()), CancellationToken::new()));
    let mut job = Job::new(config, Box::new(module), Arc::new(DefaultClients), emitter);
    if let Some(status) = status {
        job = job.with_status(status);
    }
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(job.run(cancel.clone()));
    Running {
        buf,
        cancel,
        handle,
    }
}

fn count(lines: &[String], prefix: &str) -> usize {
    lines.iter().filter(|l| l.starts_with(prefix)).count()
}

fn chart_lines(lines: &[String]) -> (usize, usize) {
    let live = lines
        .iter()
        .filter(|l| l.starts_with("CHART") && !l.contains("'obsolete'"))
        .count();
    let obsolete = lines
        .iter()
        .filter(|l| l.starts_with("CHART") && l.contains("'obsolete'"))
        .count();
    (live, obsolete)
}

#[tokio::test(start_paused = true)]
async fn test_announce_collect_and_stop() {
    let module = Scripted::default();
    let calls = module.calls();
    let status: StatusTable = Default::default();
    status.insert(
        JobConfig::new("fake", "job").key(),
        JobStatus {
            module: "fake".into(),
            name: "job".into(),
            source: "test".into(),
            state: JobState::Created,
            update_every: 1,
            strikes: 0,
            last_error: None,
        },
    );
    let job = start(config(1, 0), module, Some(status.clone()));

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(status.get(&JobConfig::new("fake", "job").key()).unwrap().state, JobState::Running);

    job.cancel.cancel();
    assert_eq!(job.handle.await.unwrap(), JobExit::Stopped);

    let lines = job.buf.lines();
    assert_eq!(
        lines[0],
        "CHART 'fake.load_job' '' 'Load' 'units' '' '' 0 70000 1 '' 'fake' 'job'"
    );
    assert_eq!(lines[1], "DIMENSION 'value' 'value' absolute 1 1 ''");
    assert_eq!(lines[2], "BEGIN 'fake.load_job'");
    assert_eq!(lines[3], "SET 'value' = 1");
    assert!(count(&lines, "BEGIN") >= 3);
    assert_eq!(count(&lines, "BEGIN"), count(&lines, "END"));
    assert_eq!(chart_lines(&lines), (1, 1));
    assert!(lines.last().unwrap().contains("'obsolete'"));

    let calls = calls.lock().unwrap();
    assert_eq!(calls.init, 1);
    assert_eq!(calls.check, 1);
    assert_eq!(calls.cleanup, 1);
    assert_eq!(status.get(&JobConfig::new("fake", "job").key()).unwrap().state, JobState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_check_retry_is_quiet() {
    let module = Scripted {
        checks: VecDeque::from([Err(CollectorError::unavailable("HTTP 500"))]),
        ..Default::default()
    };
    let calls = module.calls();
    let job = start(config(1, 1), module, None);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(job.buf.contents().is_empty());

    tokio::time::sleep(Duration::from_secs(3)).await;
    job.cancel.cancel();
    assert_eq!(job.handle.await.unwrap(), JobExit::Stopped);

    let lines = job.buf.lines();
    assert_eq!(chart_lines(&lines), (1, 1));
    assert_eq!(count(&lines, "DIMENSION"), 1);
    assert!(count(&lines, "BEGIN") >= 2);
    assert_eq!(calls.lock().unwrap().check, 2);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_check_failure_is_dead() {
    let module = Scripted {
        checks: VecDeque::from([Err(CollectorError::Auth("401".into()))]),
        ..Default::default()
    };
    let calls = module.calls();
    let job = start(config(1, 5), module, None);

    assert_eq!(job.handle.await.unwrap(), JobExit::Dead);
    assert!(job.buf.contents().is_empty());
    let calls = calls.lock().unwrap();
    assert_eq!(calls.check, 1);
    assert_eq!(calls.collect, 0);
    assert_eq!(calls.cleanup, 1);
}

#[tokio::test(start_paused = true)]
async fn test_check_retries_exhausted() {
    let module = Scripted {
        checks: (0..3)
            .map(|_| Err(CollectorError::unavailable("connection refused")))
            .collect(),
        ..Default::default()
    };
    let calls = module.calls();
    let job = start(config(2, 2), module, None);

    assert_eq!(job.handle.await.unwrap(), JobExit::Dead);
    assert_eq!(calls.lock().unwrap().check, 3);
    assert!(job.buf.contents().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_init_failure_is_dead() {
    let module = Scripted {
        init_error: Some(CollectorError::config("url is required")),
        ..Default::default()
    };
    let calls = module.calls();
    let job = start(config(1, 3), module, None);

    assert_eq!(job.handle.await.unwrap(), JobExit::Dead);
    assert_eq!(calls.lock().unwrap().check, 0);
}

#[tokio::test(start_paused = true)]
async fn test_strikes_recheck_without_reannounce() {
    let module = Scripted {
        collects: (0..STRIKE_THRESHOLD)
            .map(|_| Step::Fail(CollectorError::protocol("bad json")))
            .collect(),
        ..Default::default()
    };
    let calls = module.calls();
    let job = start(config(1, 0), module, None);

    tokio::time::sleep(Duration::from_secs(8)).await;
    job.cancel.cancel();
    assert_eq!(job.handle.await.unwrap(), JobExit::Stopped);

    let lines = job.buf.lines();
    // announced once, re-check after three strikes stays silent
    assert_eq!(chart_lines(&lines), (1, 1));
    assert_eq!(count(&lines, "DIMENSION"), 1);
    assert!(count(&lines, "BEGIN") >= 2);
    assert_eq!(calls.lock().unwrap().check, 2);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_collect_times_out_then_dies() {
    let module = Scripted {
        checks: VecDeque::from([Ok(()), Err(CollectorError::Timeout(Duration::from_secs(1)))]),
        collects: (0..STRIKE_THRESHOLD).map(|_| Step::Hang).collect(),
        timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let calls = module.calls();
    let job = start(config(2, 0), module, None);

    let exit = tokio::time::timeout(Duration::from_secs(30), job.handle)
        .await
        .expect("runner must not hang")
        .unwrap();
    assert_eq!(exit, JobExit::Dead);

    let lines = job.buf.lines();
    assert_eq!(chart_lines(&lines), (1, 1));
    assert_eq!(count(&lines, "BEGIN"), 0);
    assert!(lines.last().unwrap().contains("'obsolete'"));

    let calls = calls.lock().unwrap();
    assert_eq!(calls.collect, 3);
    assert_eq!(calls.check, 2);
}

#[tokio::test(start_paused = true)]
async fn test_panic_is_a_strike() {
    let module = Scripted {
        collects: VecDeque::from([Step::Panic]),
        ..Default::default()
    };
    let calls = module.calls();
    let job = start(config(1, 0), module, None);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    job.cancel.cancel();
    assert_eq!(job.handle.await.unwrap(), JobExit::Stopped);

    assert!(count(&job.buf.lines(), "BEGIN") >= 1);
    assert_eq!(calls.lock().unwrap().check, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_hanging_collect() {
    let module = Scripted {
        collects: VecDeque::from([Step::Hang]),
        ..Default::default()
    };
    let calls = module.calls();
    let job = start(config(60, 0), module, None);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(calls.lock().unwrap().collect, 1);

    job.cancel.cancel();
    let exit = tokio::time::timeout(Duration::from_millis(100), job.handle)
        .await
        .expect("stop must not wait for the collect deadline")
        .unwrap();
    assert_eq!(exit, JobExit::Stopped);
    assert_eq!(calls.lock().unwrap().cleanup, 1);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_check_times_out() {
    let module = Scripted {
        hang_check: true,
        ..Default::default()
    };
    let calls = module.calls();
    let job = start(config(2, 1), module, None);

    let exit = tokio::time::timeout(Duration::from_secs(30), job.handle)
        .await
        .expect("a hanging check must not block the runner")
        .unwrap();
    assert_eq!(exit, JobExit::Dead);
    // timeouts are retryable, so the one allowed retry is used
    assert_eq!(calls.lock().unwrap().check, 2);
    assert!(job.buf.contents().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hanging_cleanup_still_obsoletes() {
    let module = Scripted {
        hang_cleanup: true,
        ..Default::default()
    };
    let job = start(config(1, 0), module, None);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    job.cancel.cancel();
    let exit = tokio::time::timeout(JobSettings::default().cleanup_timeout * 2, job.handle)
        .await
        .expect("cleanup must be abandoned after its timeout")
        .unwrap();
    assert_eq!(exit, JobExit::Stopped);

    let lines = job.buf.lines();
    assert_eq!(chart_lines(&lines), (1, 1));
    assert!(lines.last().unwrap().contains("'obsolete'"));
}
