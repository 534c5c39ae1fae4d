//! Agent configuration

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command line flags. Anything given here wins over the file and environment.
#[derive(Debug, Default, Parser)]
#[command(name = "collector-agent", version, about = "Runs collector jobs and writes charts to stdout")]
pub struct Cli {
    /// Agent config file (YAML, TOML or JSON)
    #[arg(long, env = "COLLECTOR_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Job config file or directory; may be repeated
    #[arg(short = 'd', long = "config-dir")]
    pub config_dirs: Vec<PathBuf>,

    /// Read job configs once instead of watching them
    #[arg(long)]
    pub no_watch: bool,

    /// Only run these modules (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    pub modules: Vec<String>,

    /// Seconds to wait for jobs to stop on shutdown
    #[arg(long)]
    pub grace: Option<u64>,

    /// Serve health and metrics on this port
    #[arg(long)]
    pub api_port: Option<u16>,
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Job config files and directories
    pub config_dirs: Vec<PathBuf>,

    /// Watch `config_dirs` for changes
    pub watch: bool,

    /// Module filter; empty runs every built-in module
    pub modules: Vec<String>,

    /// Shutdown grace period in seconds
    pub shutdown_grace_secs: u64,

    /// API server port for health/metrics, disabled when unset
    pub api_port: Option<u16>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            config_dirs: Vec::new(),
            watch: true,
            modules: Vec::new(),
            shutdown_grace_secs: 5,
            api_port: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from the optional file and `COLLECTOR_*` environment
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("COLLECTOR")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("config_dirs")
                    .with_list_parse_key("modules"),
            )
            .build()
            .context("failed to read agent configuration")?;

        let loaded: AgentConfig = config
            .try_deserialize()
            .context("invalid agent configuration")?;
        Ok(loaded.overlay(cli))
    }

    fn overlay(mut self, cli: &Cli) -> Self {
        if !cli.config_dirs.is_empty() {
            self.config_dirs = cli.config_dirs.clone();
        }
        if cli.no_watch {
            self.watch = false;
        }
        if !cli.modules.is_empty() {
            self.modules = cli.modules.clone();
        }
        if let Some(grace) = cli.grace {
            self.shutdown_grace_secs = grace;
        }
        if cli.api_port.is_some() {
            self.api_port = cli.api_port;
        }
        self
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Module filter with "all" meaning no filter
    pub fn module_filter(&self) -> Option<&[String]> {
        if self.modules.is_empty() || self.modules.iter().any(|m| m == "all") {
            None
        } else {
            Some(&self.modules)
        }
    }
}
