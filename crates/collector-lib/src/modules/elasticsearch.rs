//! Elasticsearch cluster health

use crate::clients::{HttpClient, HttpConfig, HttpRequest};
use crate::error::{CollectorError, Result};
use crate::module::{Capabilities, Chart, ChartType, Charts, Dim, JobContext, MetricBag, Module};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

const DEFAULT_URL: &str = "http://127.0.0.1:9200";
const CLUSTER_HEALTH: &str = "/_cluster/health";
const PRIO: i64 = 1000;

#[derive(Debug, Deserialize)]
struct ClusterHealth {
    cluster_name: String,
    status: String,
    number_of_nodes: i64,
    number_of_data_nodes: i64,
    active_primary_shards: i64,
    active_shards: i64,
    relocating_shards: i64,
    initializing_shards: i64,
    unassigned_shards: i64,
    #[serde(default)]
    delayed_unassigned_shards: i64,
    #[serde(default)]
    number_of_pending_tasks: i64,
    #[serde(default)]
    number_of_in_flight_fetch: i64,
    #[serde(default)]
    active_shards_percent_as_number: f64,
}

fn health_charts() -> Vec<Chart> {
    vec![
        Chart::new("cluster_health_status", "Cluster health status", "status")
            .family("cluster health")
            .context("elasticsearch.cluster_health_status")
            .priority(PRIO)
            .with_dim(Dim::new("status_green").name("green"))
            .with_dim(Dim::new("status_yellow").name("yellow"))
            .with_dim(Dim::new("status_red").name("red")),
        Chart::new("cluster_number_of_nodes", "Cluster nodes", "nodes")
            .family("cluster health")
            .context("elasticsearch.cluster_number_of_nodes")
            .priority(PRIO + 1)
            .with_dim(Dim::new("number_of_nodes").name("nodes"))
            .with_dim(Dim::new("number_of_data_nodes").name("data_nodes")),
        Chart::new("cluster_shards_count", "Cluster shards", "shards")
            .family("cluster health")
            .context("elasticsearch.cluster_shards_count")
            .chart_type(ChartType::Stacked)
            .priority(PRIO + 2)
            .with_dim(Dim::new("active_primary_shards").name("active_primary"))
            .with_dim(Dim::new("active_shards").name("active"))
            .with_dim(Dim::new("relocating_shards").name("relocating"))
            .with_dim(Dim::new("initializing_shards").name("initializing"))
            .with_dim(Dim::new("unassigned_shards").name("unassigned"))
            .with_dim(Dim::new("delayed_unassigned_shards").name("delayed_unassigned")),
        Chart::new("cluster_pending_tasks", "Cluster pending tasks", "tasks")
            .family("cluster health")
            .context("elasticsearch.cluster_pending_tasks")
            .priority(PRIO + 3)
            .with_dim(Dim::new("number_of_pending_tasks").name("pending")),
        Chart::new("cluster_number_of_in_flight_fetch", "Cluster unfinished fetches", "fetches")
            .family("cluster health")
            .context("elasticsearch.cluster_number_of_in_flight_fetch")
            .priority(PRIO + 4)
            .with_dim(Dim::new("number_of_in_flight_fetch").name("in_flight_fetch")),
        Chart::new("cluster_active_shards_percent", "Cluster active shards", "percentage")
            .family("cluster health")
            .context("elasticsearch.cluster_active_shards_percent")
            .priority(PRIO + 5)
            .with_dim(Dim::new("active_shards_percent_as_number").name("active").div(1000)),
    ]
}

pub struct Elasticsearch {
    client: Option<Arc<dyn HttpClient>>,
    cluster_name: Option<String>,
}

impl Elasticsearch {
    pub fn new() -> Self {
        Self {
            client: None,
            cluster_name: None,
        }
    }

    async fn cluster_health(&self, ctx: &JobContext) -> Result<ClusterHealth> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| CollectorError::internal("elasticsearch used before init"))?;
        client
            .execute(ctx.cancel(), HttpRequest::get(CLUSTER_HEALTH))
            .await?
            .json()
    }
}

impl Default for Elasticsearch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for Elasticsearch {
    fn capabilities(&self) -> Capabilities {
        Capabilities::HTTP
    }

    async fn init(&mut self, ctx: &JobContext) -> Result<()> {
        let mut config = ctx.config().clone();
        if !config.options.contains_key("url") {
            config = config.with_option("url", DEFAULT_URL);
        }
        let http: HttpConfig = config.decode()?;
        http.validate()?;
        self.client = Some(ctx.clients().http(http)?);
        Ok(())
    }

    async fn check(&mut self, ctx: &JobContext) -> Result<()> {
        let health = self.cluster_health(ctx).await?;
        if health.cluster_name.is_empty() {
            return Err(CollectorError::protocol("cluster health response without cluster_name"));
        }
        self.cluster_name = Some(health.cluster_name);
        Ok(())
    }

    fn charts(&self) -> Charts {
        health_charts().into_iter().collect()
    }

    async fn collect(&mut self, ctx: &JobContext, _charts: &mut Charts) -> Result<MetricBag> {
        let health = self.cluster_health(ctx).await?;
        if self.cluster_name.as_deref() != Some(health.cluster_name.as_str()) {
            tracing::info!(cluster = %health.cluster_name, "Elasticsearch cluster name changed");
            self.cluster_name = Some(health.cluster_name.clone());
        }

        let mut bag = MetricBag::new();
        for status in ["green", "yellow", "red"] {
            bag.set_bool(format!("status_{status}"), health.status == status);
        }
        bag.set("number_of_nodes", health.number_of_nodes);
        bag.set("number_of_data_nodes", health.number_of_data_nodes);
        bag.set("active_primary_shards", health.active_primary_shards);
        bag.set("active_shards", health.active_shards);
        bag.set("relocating_shards", health.relocating_shards);
        bag.set("initializing_shards", health.initializing_shards);
        bag.set("unassigned_shards", health.unassigned_shards);
        bag.set("delayed_unassigned_shards", health.delayed_unassigned_shards);
        bag.set("number_of_pending_tasks", health.number_of_pending_tasks);
        bag.set("number_of_in_flight_fetch", health.number_of_in_flight_fetch);
        bag.set_float(
            "active_shards_percent_as_number",
            health.active_shards_percent_as_number,
            1000,
        );
        Ok(bag)
    }
}
