//! ZooKeeper server statistics from the `mntr` four-letter command

use crate::clients::{LineClient, SocketConfig, Terminator};
use crate::error::{CollectorError, Result};
use crate::module::{Capabilities, Chart, ChartType, Charts, Dim, JobContext, MetricBag, Module};
use async_trait::async_trait;
use std::sync::Arc;

const DEFAULT_ADDRESS: &str = "127.0.0.1:2181";
const MNTR: &str = "mntr";
const NOT_WHITELISTED: &str = "is not executed because it is not in the whitelist";
const PRIO: i64 = 1000;

/// Server states reported as `zk_server_state`
const SERVER_STATES: [&str; 4] = ["leader", "follower", "observer", "standalone"];

fn server_charts() -> Vec<Chart> {
    vec![
        Chart::new("requests", "Outstanding requests", "requests")
            .family("requests")
            .context("zookeeper.requests")
            .priority(PRIO)
            .with_dim(Dim::new("outstanding_requests").name("outstanding")),
        Chart::new("requests_latency", "Requests latency", "ms")
            .family("requests")
            .context("zookeeper.requests_latency")
            .priority(PRIO + 1)
            .with_dim(Dim::new("min_latency").name("min").div(1000))
            .with_dim(Dim::new("avg_latency").name("avg").div(1000))
            .with_dim(Dim::new("max_latency").name("max").div(1000)),
        Chart::new("connections", "Alive connections", "connections")
            .family("connections")
            .context("zookeeper.connections")
            .priority(PRIO + 2)
            .with_dim(Dim::new("num_alive_connections").name("alive")),
        Chart::new("packets", "Packets", "pps")
            .family("net")
            .context("zookeeper.packets")
            .priority(PRIO + 3)
            .with_dim(Dim::new("packets_received").name("received").incremental())
            .with_dim(Dim::new("packets_sent").name("sent").incremental().mul(-1)),
        Chart::new("file_descriptor", "Open file descriptors", "file descriptors")
            .family("file descriptors")
            .context("zookeeper.file_descriptor")
            .priority(PRIO + 4)
            .with_dim(Dim::new("open_file_descriptor_count").name("open")),
        Chart::new("nodes", "Number of nodes", "nodes")
            .family("data tree")
            .context("zookeeper.nodes")
            .priority(PRIO + 5)
            .with_dim(Dim::new("znode_count").name("znode"))
            .with_dim(Dim::new("ephemerals_count").name("ephemerals")),
        Chart::new("watches", "Number of watches", "watches")
            .family("data tree")
            .context("zookeeper.watches")
            .priority(PRIO + 6)
            .with_dim(Dim::new("watch_count").name("watches")),
        Chart::new("approximate_data_size", "Approximate data tree size", "KiB")
            .family("data tree")
            .context("zookeeper.approximate_data_size")
            .priority(PRIO + 7)
            .with_dim(Dim::new("approximate_data_size").name("size").div(1024)),
        SERVER_STATES.iter().fold(
            Chart::new("server_state", "Server state", "state")
                .family("server state")
                .context("zookeeper.server_state")
                .chart_type(ChartType::Line)
                .priority(PRIO + 8),
            |chart, state| chart.with_dim(Dim::new(format!("server_state_{state}")).name(*state)),
        ),
    ]
}

/// Turn `mntr` output into metric values.
///
/// Keys lose their `zk_` prefix; latencies keep three decimals since newer
/// servers report them as floats.
fn parse_mntr(lines: &[String]) -> Result<MetricBag> {
    if lines.iter().any(|l| l.contains(NOT_WHITELISTED)) {
        return Err(CollectorError::protocol(format!(
            "'{MNTR}' is not in the server's 4lw.commands.whitelist"
        )));
    }

    let mut bag = MetricBag::new();
    for line in lines {
        let Some((key, value)) = line.split_once('\t') else {
            continue;
        };
        let Some(key) = key.trim().strip_prefix("zk_") else {
            continue;
        };
        let value = value.trim();

        match key {
            "server_state" => {
                for state in SERVER_STATES {
                    bag.set_bool(format!("server_state_{state}"), value == state);
                }
            }
            "min_latency" | "avg_latency" | "max_latency" => {
                if let Ok(v) = value.parse::<f64>() {
                    bag.set_float(key, v, 1000);
                }
            }
            _ => {
                if let Ok(v) = value.parse::<i64>() {
                    bag.set(key, v);
                }
            }
        }
    }

    if bag.is_empty() {
        return Err(CollectorError::protocol("empty or unrecognised mntr response"));
    }
    Ok(bag)
}

pub struct Zookeeper {
    client: Option<Arc<dyn LineClient>>,
}

impl Zookeeper {
    pub fn new() -> Self {
        Self { client: None }
    }

    async fn mntr(&self, ctx: &JobContext) -> Result<MetricBag> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| CollectorError::internal("zookeeper used before init"))?;
        let lines = client.query(ctx.cancel(), MNTR).await?;
        parse_mntr(&lines)
    }
}

impl Default for Zookeeper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for Zookeeper {
    fn capabilities(&self) -> Capabilities {
        Capabilities::SOCKET
    }

    async fn init(&mut self, ctx: &JobContext) -> Result<()> {
        let mut config = ctx.config().clone();
        if !config.options.contains_key("address") {
            config = config.with_option("address", DEFAULT_ADDRESS);
        }
        // the server closes the connection after answering
        let socket: SocketConfig = config.decode::<SocketConfig>()?.with_terminator(Terminator::Eof);
        socket.validate()?;
        self.client = Some(ctx.clients().line_socket(socket)?);
        Ok(())
    }

    async fn check(&mut self, ctx: &JobContext) -> Result<()> {
        self.mntr(ctx).await.map(|_| ())
    }

    fn charts(&self) -> Charts {
        server_charts().into_iter().collect()
    }

    async fn collect(&mut self, ctx: &JobContext, _charts: &mut Charts) -> Result<MetricBag> {
        self.mntr(ctx).await
    }
}
