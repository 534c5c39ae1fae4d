//! Job config discovery
//!
//! Discoverers turn configuration sources into [`ConfGroup`]s. Each group is
//! a full snapshot of its source; the job manager diffs it against the
//! previous snapshot of the same source.

mod dummy;
mod file_read;
mod file_watch;
mod manager;

pub use dummy::DummyDiscoverer;
pub use file_read::FileReader;
pub use file_watch::{FileWatcher, DEBOUNCE_WINDOW, RESCAN_INTERVAL};
pub use manager::DiscoveryManager;

use crate::confgroup::ConfGroup;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A source of config groups.
///
/// `run` consumes the discoverer, so every run starts from empty state.
#[async_trait]
pub trait Discoverer: Send {
    fn name(&self) -> &'static str;

    /// Produce groups until finished or cancelled
    async fn run(self: Box<Self>, cancel: CancellationToken, tx: mpsc::Sender<ConfGroup>) -> Result<()>;
}

/// Send a group unless the receiver is gone or the run is cancelled.
/// Returns false when the discoverer should stop.
pub(crate) async fn send_group(
    tx: &mpsc::Sender<ConfGroup>,
    cancel: &CancellationToken,
    group: ConfGroup,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(group) => sent.is_ok(),
    }
}
