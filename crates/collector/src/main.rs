//! Collector Agent - runs collector jobs for a parent monitoring agent
//!
//! Job configs are discovered from files, each job collects on its own
//! interval, and charts are written to stdout in the line protocol. Logs
//! go to stderr.

use anyhow::{bail, Result};
use clap::Parser;
use collector_agent::{api, config};
use collector_lib::{
    modules::builtin_registry,
    observability::RuntimeMetrics,
    runtime::{Runtime, RuntimeOptions},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = config::Cli::parse();
    let config = config::AgentConfig::load(&cli)?;
    info!(
        config_dirs = ?config.config_dirs,
        watch = config.watch,
        "Agent configured"
    );

    let mut registry = builtin_registry()?;
    if let Some(filter) = config.module_filter() {
        let unknown = registry.restrict(filter);
        if !unknown.is_empty() {
            warn!(modules = ?unknown, "Ignoring unknown modules");
        }
    }
    if registry.is_empty() {
        bail!("no modules left to run");
    }

    let options = RuntimeOptions {
        paths: config.config_dirs.clone(),
        watch: config.watch,
        grace: config.grace(),
        ..RuntimeOptions::default()
    };
    let runtime = Runtime::new(options, Arc::new(registry));

    if let Some(port) = config.api_port {
        let app_state = Arc::new(api::AppState::new(
            runtime.health(),
            RuntimeMetrics::new(),
            runtime.status(),
        ));
        tokio::spawn(async move {
            if let Err(e) = api::serve(port, app_state).await {
                warn!(error = %e, "API server stopped");
            }
        });
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SIGINT received");
            on_signal.cancel();
        }
    });

    runtime.run(cancel).await
}
