//! ICMP round-trip time and packet loss per host

use crate::clients::{ProbeConfig, ProbeStats, Prober};
use crate::config::decode;
use crate::error::{CollectorError, Result};
use crate::module::{Base, Capabilities, Charts, JobContext, MetricBag, Module};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub mod contexts {
    crate::define_contexts! {
        HOST_RTT = {
            context: "ping.host_rtt",
            title: "Ping round-trip time",
            units: "milliseconds",
            family: "latency",
            chart_type: Area,
            priority: 1000,
            labels: ["host"],
            dims: [("min", Absolute, 1, 1000), ("max", Absolute, 1, 1000), ("avg", Absolute, 1, 1000)],
        };
        HOST_STD_DEV_RTT = {
            context: "ping.host_std_dev_rtt",
            title: "Ping round-trip time standard deviation",
            units: "milliseconds",
            family: "latency",
            chart_type: Line,
            priority: 1001,
            labels: ["host"],
            dims: [("std_dev", Absolute, 1, 1000)],
        };
        HOST_PACKET_LOSS = {
            context: "ping.host_packet_loss",
            title: "Ping packet loss",
            units: "percentage",
            family: "packet loss",
            chart_type: Line,
            priority: 1002,
            labels: ["host"],
            dims: [("loss", Absolute, 1, 1000)],
        };
        HOST_PACKETS = {
            context: "ping.host_packets",
            title: "Ping packets transferred",
            units: "packets",
            family: "packets",
            chart_type: Line,
            priority: 1003,
            labels: ["host"],
            dims: [("received", Absolute, 1, 1), ("sent", Absolute, 1, 1)],
        };
    }
}

#[derive(Debug, Deserialize)]
struct Options {
    #[serde(default, with = "decode::string_list")]
    hosts: Vec<String>,
    #[serde(flatten)]
    probe: ProbeConfig,
}

pub struct Ping {
    base: Base,
    hosts: Vec<String>,
    probe: ProbeConfig,
    prober: Option<Arc<dyn Prober>>,
}

impl Ping {
    pub fn new() -> Self {
        Self {
            base: Base::new("ping"),
            hosts: Vec::new(),
            probe: ProbeConfig::default(),
            prober: None,
        }
    }

    fn prober(&self) -> Result<&Arc<dyn Prober>> {
        self.prober
            .as_ref()
            .ok_or_else(|| CollectorError::internal("ping used before init"))
    }

    /// Probe every host concurrently. Hosts that fail are left without data;
    /// the cycle fails only when no host answered.
    async fn probe_all(&self, ctx: &JobContext) -> Result<Vec<(String, ProbeStats)>> {
        let prober = self.prober()?;
        let results = join_all(
            self.hosts
                .iter()
                .map(|host| async move { (host, prober.probe(ctx.cancel(), host).await) }),
        )
        .await;

        let mut stats = Vec::with_capacity(results.len());
        let mut last_error = None;
        for (host, res) in results {
            match res {
                Ok(s) => stats.push((host.clone(), s)),
                Err(CollectorError::Cancelled) => return Err(CollectorError::Cancelled),
                Err(e) => {
                    debug!(host = %host, error = %e, "Ping probe failed");
                    last_error = Some(e);
                }
            }
        }

        match (stats.is_empty(), last_error) {
            (true, Some(err)) => Err(err),
            _ => Ok(stats),
        }
    }
}

impl Default for Ping {
    fn default() -> Self {
        Self::new()
    }
}

fn micros(d: Duration) -> i64 {
    d.as_micros() as i64
}

#[async_trait]
impl Module for Ping {
    fn capabilities(&self) -> Capabilities {
        Capabilities::ICMP
    }

    async fn init(&mut self, ctx: &JobContext) -> Result<()> {
        let opts: Options = ctx.options()?;
        if opts.hosts.is_empty() {
            return Err(CollectorError::config("'hosts' option not set"));
        }
        opts.probe.validate()?;

        self.base.set_update_every(ctx.config().update_every);
        self.prober = Some(ctx.clients().prober(opts.probe.clone())?);
        self.hosts = opts.hosts;
        self.probe = opts.probe;
        Ok(())
    }

    async fn check(&mut self, ctx: &JobContext) -> Result<()> {
        let stats = self.probe_all(ctx).await?;
        if stats.iter().all(|(_, s)| s.received == 0) {
            return Err(CollectorError::unavailable("no host replied"));
        }
        Ok(())
    }

    fn charts(&self) -> Charts {
        Charts::new()
    }

    async fn collect(&mut self, ctx: &JobContext, charts: &mut Charts) -> Result<MetricBag> {
        use self::contexts::{HOST_PACKETS, HOST_PACKET_LOSS, HOST_RTT, HOST_STD_DEV_RTT};

        let mut bag = MetricBag::new();
        let single = self.hosts.len() == 1;
        for (host, s) in self.probe_all(ctx).await? {
            // a job probing one host needs no host suffix on its charts
            let instance = if single {
                String::new()
            } else {
                HOST_RTT.instance_id(&[("host", host.as_str())])?
            };
            let instance = instance.as_str();

            crate::contexts::set_instance(
                charts,
                &mut bag,
                &HOST_PACKETS,
                instance,
                &[("received", i64::from(s.received)), ("sent", i64::from(s.sent))],
            )?;
            crate::contexts::set_instance(
                charts,
                &mut bag,
                &HOST_PACKET_LOSS,
                instance,
                &[("loss", (s.loss * 1000.0).round() as i64)],
            )?;
            if s.received > 0 {
                crate::contexts::set_instance(
                    charts,
                    &mut bag,
                    &HOST_RTT,
                    instance,
                    &[("min", micros(s.min)), ("max", micros(s.max)), ("avg", micros(s.avg))],
                )?;
                crate::contexts::set_instance(
                    charts,
                    &mut bag,
                    &HOST_STD_DEV_RTT,
                    instance,
                    &[("std_dev", micros(s.stddev))],
                )?;
            }
        }
        Ok(bag)
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.probe.max_duration())
    }
}
