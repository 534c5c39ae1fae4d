//! Adaptec RAID logical device health via `arcconf`

use crate::clients::{ExecConfig, Executor};
use crate::config::decode;
use crate::error::{CollectorError, Result};
use crate::module::{Base, Capabilities, Charts, JobContext, MetricBag, Module};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub mod contexts {
    crate::define_contexts! {
        LOGICAL_DEVICE_STATUS = {
            context: "adaptecraid.logical_device_status",
            title: "Logical device status",
            units: "status",
            family: "logical devices",
            chart_type: Line,
            priority: 1000,
            labels: ["ld_number"],
            dims: [("ok", Absolute, 1, 1), ("critical", Absolute, 1, 1)],
        };
    }
}

const GET_LOGICAL_DEVICES: [&str; 3] = ["GETCONFIG", "1", "LD"];

#[derive(Debug, Deserialize)]
struct Options {
    #[serde(default = "default_arcconf")]
    arcconf_path: PathBuf,
    #[serde(default = "default_timeout", with = "decode::duration")]
    timeout: Duration,
}

fn default_arcconf() -> PathBuf {
    PathBuf::from("/usr/sbin/arcconf")
}

fn default_timeout() -> Duration {
    Duration::from_secs(2)
}

#[derive(Debug, Default, PartialEq)]
struct LogicalDevice {
    number: String,
    name: String,
    raid_level: String,
    status: String,
}

impl LogicalDevice {
    fn is_ok(&self) -> bool {
        matches!(self.status.as_str(), "Optimal" | "OK")
    }
}

/// Parse the `GETCONFIG 1 LD` report; devices without a status are dropped
fn parse_logical_devices(report: &str) -> Vec<LogicalDevice> {
    let mut devices = Vec::new();
    let mut current: Option<LogicalDevice> = None;

    for line in report.lines().map(str::trim) {
        if let Some(number) = line.strip_prefix("Logical Device number") {
            devices.extend(current.take());
            current = Some(LogicalDevice {
                number: number.trim().to_string(),
                ..Default::default()
            });
            continue;
        }
        let (Some(device), Some((key, value))) = (current.as_mut(), line.split_once(':')) else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "Logical Device name" => device.name = value,
            "RAID level" => device.raid_level = value,
            "Status of Logical Device" => device.status = value,
            _ => {}
        }
    }
    devices.extend(current);
    devices.retain(|d| !d.status.is_empty());
    devices
}

pub struct AdaptecRaid {
    base: Base,
    exec: Option<Arc<dyn Executor>>,
}

impl AdaptecRaid {
    pub fn new() -> Self {
        Self {
            base: Base::new("adaptecraid"),
            exec: None,
        }
    }

    async fn logical_devices(&self, ctx: &JobContext) -> Result<Vec<LogicalDevice>> {
        let exec = self
            .exec
            .as_ref()
            .ok_or_else(|| CollectorError::internal("adaptecraid used before init"))?;
        let output = exec.run(ctx.cancel(), &GET_LOGICAL_DEVICES).await?;
        Ok(parse_logical_devices(&output.stdout_lossy()))
    }
}

impl Default for AdaptecRaid {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for AdaptecRaid {
    fn capabilities(&self) -> Capabilities {
        Capabilities::EXEC
    }

    async fn init(&mut self, ctx: &JobContext) -> Result<()> {
        let opts: Options = ctx.options()?;
        let exec = ExecConfig::new(opts.arcconf_path, opts.timeout);
        self.exec = Some(ctx.clients().exec(exec)?);
        self.base.set_update_every(ctx.config().update_every);
        Ok(())
    }

    async fn check(&mut self, ctx: &JobContext) -> Result<()> {
        if self.logical_devices(ctx).await?.is_empty() {
            return Err(CollectorError::protocol("no logical devices in arcconf output"));
        }
        Ok(())
    }

    fn charts(&self) -> Charts {
        Charts::new()
    }

    async fn collect(&mut self, ctx: &JobContext, charts: &mut Charts) -> Result<MetricBag> {
        let devices = self.logical_devices(ctx).await?;

        self.base.begin_cycle();
        let mut bag = MetricBag::new();
        for device in &devices {
            let ok = device.is_ok();
            if !ok {
                debug!(
                    ld = %device.number,
                    name = %device.name,
                    raid_level = %device.raid_level,
                    status = %device.status,
                    "Logical device not optimal"
                );
            }
            let chart_id = crate::contexts::set(
                charts,
                &mut bag,
                &contexts::LOGICAL_DEVICE_STATUS,
                &[("ld_number", device.number.as_str())],
                &[("ok", i64::from(ok)), ("critical", i64::from(!ok))],
            )?;
            self.base.mark_seen(&chart_id);
        }
        for chart_id in self.base.take_vanished() {
            if charts.contains(&chart_id) {
                charts
                    .mark_obsolete(&chart_id)
                    .map_err(|e| CollectorError::internal(e.to_string()))?;
            }
        }
        Ok(bag)
    }
}
