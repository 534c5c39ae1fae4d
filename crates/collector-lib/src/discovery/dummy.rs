//! Discovery without config files

use super::{send_group, Discoverer};
use crate::confgroup::{ConfGroup, DefaultsLookup, JobConfig};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DUMMY_SOURCE: &str = "internal";

/// Emits one default job per requested module, named after the module
pub struct DummyDiscoverer {
    modules: Vec<String>,
    defaults: Arc<dyn DefaultsLookup>,
}

impl DummyDiscoverer {
    pub fn new(modules: Vec<String>, defaults: Arc<dyn DefaultsLookup>) -> Self {
        Self { modules, defaults }
    }

    fn group(&self) -> ConfGroup {
        let configs = self
            .modules
            .iter()
            .map(|module| {
                let mut config = JobConfig::new(module, module);
                if let Some(defaults) = self.defaults.defaults_for(module) {
                    config.update_every = defaults.update_every;
                    config.autodetection_retry = defaults.autodetection_retry;
                    config.priority = defaults.priority;
                }
                config.source = DUMMY_SOURCE.to_string();
                config
            })
            .collect();
        ConfGroup::new(DUMMY_SOURCE, configs)
    }
}

#[async_trait]
impl Discoverer for DummyDiscoverer {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken, tx: mpsc::Sender<ConfGroup>) -> Result<()> {
        send_group(&tx, &cancel, self.group()).await;
        Ok(())
    }
}
