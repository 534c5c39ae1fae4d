//! Watching file discovery
//!
//! Emits the initial scan, then re-reads files as the filesystem reports
//! changes. Bursts of events are coalesced, unchanged content is not
//! re-emitted and a periodic rescan catches notifications the platform
//! dropped.

use super::{send_group, Discoverer};
use crate::confgroup::{ConfGroup, DefaultsLookup};
use crate::config::{expand_paths, is_job_file, parse_conf_group, source_id};
use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A file is re-read once this long has passed without a new event for it
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Full rescan period
pub const RESCAN_INTERVAL: Duration = Duration::from_secs(60);

pub struct FileWatcher {
    paths: Vec<PathBuf>,
    defaults: Arc<dyn DefaultsLookup>,
    debounce: Duration,
    rescan: Duration,
}

impl FileWatcher {
    pub fn new(paths: Vec<PathBuf>, defaults: Arc<dyn DefaultsLookup>) -> Self {
        Self {
            paths,
            defaults,
            debounce: DEBOUNCE_WINDOW,
            rescan: RESCAN_INTERVAL,
        }
    }

    pub fn with_rescan(mut self, rescan: Duration) -> Self {
        self.rescan = rescan;
        self
    }

    /// Watch directories, and the parents of plain files so that their
    /// creation and removal are seen
    fn watch_paths(&self, watcher: &mut RecommendedWatcher) -> Result<()> {
        let mut watched = HashSet::new();
        for path in &self.paths {
            let dir = if path.is_dir() {
                path.clone()
            } else {
                match path.parent() {
                    Some(parent) if parent.is_dir() => parent.to_path_buf(),
                    _ => {
                        warn!(path = %path.display(), "Cannot watch config path, relying on rescans");
                        continue;
                    }
                }
            };
            if watched.insert(dir.clone()) {
                watcher
                    .watch(&dir, RecursiveMode::NonRecursive)
                    .with_context(|| format!("Failed to watch {}", dir.display()))?;
                info!(path = %dir.display(), "Watching config directory");
            }
        }
        Ok(())
    }

    /// Whether `path` belongs to one of the configured paths
    fn is_relevant(&self, path: &Path) -> bool {
        if !is_job_file(path) {
            return false;
        }
        self.paths
            .iter()
            .any(|p| p == path || (p.is_dir() && path.parent() == Some(p.as_path())))
    }
}

/// Per-run state: fingerprints of what has been emitted
#[derive(Default)]
struct Seen {
    fingerprints: HashMap<PathBuf, String>,
}

impl Seen {
    /// Build the group to emit for `path`, if anything changed
    async fn refresh(&mut self, path: &Path, defaults: &dyn DefaultsLookup) -> Option<ConfGroup> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self
                    .fingerprints
                    .remove(path)
                    .map(|_| ConfGroup::empty(source_id(path)));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read job file");
                return None;
            }
        };

        let fingerprint = compute_fingerprint(&content);
        if self.fingerprints.get(path) == Some(&fingerprint) {
            return None;
        }
        self.fingerprints.insert(path.to_path_buf(), fingerprint);

        match parse_conf_group(path, &String::from_utf8_lossy(&content), defaults) {
            Ok(group) => Some(group),
            Err(e) => {
                warn!(error = %e, "Keeping previous jobs of invalid job file");
                None
            }
        }
    }

    fn known(&self) -> Vec<PathBuf> {
        self.fingerprints.keys().cloned().collect()
    }
}

fn compute_fingerprint(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[async_trait]
impl Discoverer for FileWatcher {
    fn name(&self) -> &'static str {
        "file_watch"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken, tx: mpsc::Sender<ConfGroup>) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for path in event.paths {
                        let _ = events_tx.send(path);
                    }
                }
                Err(e) => warn!(error = %e, "Filesystem watch error"),
            },
            notify::Config::default(),
        )
        .context("Failed to create filesystem watcher")?;
        self.watch_paths(&mut watcher)?;

        let defaults = self.defaults.as_ref();
        let mut seen = Seen::default();

        for file in expand_paths(&self.paths).await {
            if let Some(group) = seen.refresh(&file, defaults).await {
                if !send_group(&tx, &cancel, group).await {
                    return Ok(());
                }
            }
        }

        let mut rescan = tokio::time::interval_at(Instant::now() + self.rescan, self.rescan);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending = Debouncer::new(self.debounce);

        loop {
            let mut changed: Vec<PathBuf> = Vec::new();
            let flush_at = pending.next_due();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(path) => {
                        if self.is_relevant(&path) {
                            pending.touch(path, Instant::now());
                        }
                    }
                    None => {
                        warn!("Filesystem watcher stopped, relying on rescans");
                        cancel.cancelled().await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    changed.extend(pending.take_due(Instant::now()));
                }
                _ = rescan.tick() => {
                    debug!("Rescanning config paths");
                    let mut files = expand_paths(&self.paths).await;
                    for known in seen.known() {
                        if !files.contains(&known) {
                            files.push(known);
                        }
                    }
                    changed.extend(files);
                }
            }

            changed.sort();
            for path in changed {
                if let Some(group) = seen.refresh(&path, defaults).await {
                    debug!(source = %group.source, jobs = group.configs.len(), "Config changed");
                    if !send_group(&tx, &cancel, group).await {
                        return Ok(());
                    }
                }
            }
        }

        drop(watcher);
        Ok(())
    }
}

/// Trailing-edge debounce kept per file: each event pushes that file's
/// deadline out by the window, other files are unaffected
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    due: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            due: HashMap::new(),
        }
    }

    fn touch(&mut self, path: PathBuf, now: Instant) {
        self.due.insert(path, now + self.window);
    }

    fn next_due(&self) -> Option<Instant> {
        self.due.values().min().copied()
    }

    fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let ready: Vec<PathBuf> = self
            .due
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.due.remove(path);
        }
        ready
    }
}
