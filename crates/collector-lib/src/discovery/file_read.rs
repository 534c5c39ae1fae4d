//! One-shot file discovery

use super::{send_group, Discoverer};
use crate::confgroup::{ConfGroup, DefaultsLookup};
use crate::config::{expand_paths, load_file};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Reads every configured job file once
pub struct FileReader {
    paths: Vec<PathBuf>,
    defaults: Arc<dyn DefaultsLookup>,
}

impl FileReader {
    pub fn new(paths: Vec<PathBuf>, defaults: Arc<dyn DefaultsLookup>) -> Self {
        Self { paths, defaults }
    }
}

#[async_trait]
impl Discoverer for FileReader {
    fn name(&self) -> &'static str {
        "file_read"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken, tx: mpsc::Sender<ConfGroup>) -> Result<()> {
        let files = expand_paths(&self.paths).await;
        info!(files = files.len(), "Reading job files");

        for file in files {
            match load_file(&file, self.defaults.as_ref()).await {
                Ok(group) => {
                    if !send_group(&tx, &cancel, group).await {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Skipping job file"),
            }
        }
        Ok(())
    }
}
