//! systemd unit states via `systemctl list-units`

use crate::clients::{ExecConfig, Executor};
use crate::config::decode;
use crate::error::{CollectorError, Result};
use crate::module::{Base, Capabilities, Charts, JobContext, MetricBag, Module};
use async_trait::async_trait;
use glob::Pattern;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub mod contexts {
    crate::define_contexts! {
        UNIT_STATE = {
            context: "systemdunits.unit_state",
            title: "Unit state",
            units: "state",
            family: "units",
            chart_type: Line,
            priority: 1000,
            labels: ["unit_name"],
            dims: [
                ("active", Absolute, 1, 1),
                ("inactive", Absolute, 1, 1),
                ("activating", Absolute, 1, 1),
                ("deactivating", Absolute, 1, 1),
                ("failed", Absolute, 1, 1),
            ],
        };
    }
}

const STATES: [&str; 5] = ["active", "inactive", "activating", "deactivating", "failed"];

const LIST_UNITS: [&str; 5] = ["list-units", "--all", "--plain", "--no-legend", "--no-pager"];

#[derive(Debug, Deserialize)]
struct Options {
    #[serde(default, with = "decode::string_list")]
    include: Vec<String>,
    #[serde(default = "default_systemctl")]
    systemctl_path: PathBuf,
    #[serde(default = "default_timeout", with = "decode::duration")]
    timeout: Duration,
}

fn default_systemctl() -> PathBuf {
    PathBuf::from("/usr/bin/systemctl")
}

fn default_timeout() -> Duration {
    Duration::from_secs(2)
}

/// One row of `systemctl list-units`
#[derive(Debug, PartialEq)]
struct UnitRow<'a> {
    name: &'a str,
    active: &'a str,
}

/// Columns are UNIT LOAD ACTIVE SUB DESCRIPTION; the description may hold spaces
fn parse_row(line: &str) -> Option<UnitRow<'_>> {
    let mut fields = line.split_whitespace().skip_while(|f| *f == "●" || *f == "*");
    let name = fields.next()?;
    let _load = fields.next()?;
    let active = fields.next()?;
    Some(UnitRow { name, active })
}

pub struct SystemdUnits {
    base: Base,
    include: Vec<Pattern>,
    exec: Option<Arc<dyn Executor>>,
}

impl SystemdUnits {
    pub fn new() -> Self {
        Self {
            base: Base::new("systemdunits"),
            include: Vec::new(),
            exec: None,
        }
    }

    fn is_included(&self, unit: &str) -> bool {
        self.include.iter().any(|p| p.matches(unit))
    }

    /// Matching units with their ACTIVE column, in systemctl order
    async fn list_units(&self, ctx: &JobContext) -> Result<Vec<(String, String)>> {
        let exec = self
            .exec
            .as_ref()
            .ok_or_else(|| CollectorError::internal("systemdunits used before init"))?;
        let output = exec.run(ctx.cancel(), &LIST_UNITS).await?;

        let stdout = output.stdout_lossy();
        let units = stdout
            .lines()
            .filter_map(parse_row)
            .filter(|row| self.is_included(row.name))
            .map(|row| (row.name.to_string(), row.active.to_string()))
            .collect();
        Ok(units)
    }
}

impl Default for SystemdUnits {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for SystemdUnits {
    fn capabilities(&self) -> Capabilities {
        Capabilities::EXEC
    }

    async fn init(&mut self, ctx: &JobContext) -> Result<()> {
        let opts: Options = ctx.options()?;
        if opts.include.is_empty() {
            return Err(CollectorError::config("'include' option not set"));
        }
        self.include = opts
            .include
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| CollectorError::config(format!("invalid include pattern '{p}': {e}")))
            })
            .collect::<Result<_>>()?;

        let exec = ExecConfig::new(opts.systemctl_path, opts.timeout);
        self.exec = Some(ctx.clients().exec(exec)?);
        self.base.set_update_every(ctx.config().update_every);
        Ok(())
    }

    async fn check(&mut self, ctx: &JobContext) -> Result<()> {
        if self.list_units(ctx).await?.is_empty() {
            return Err(CollectorError::unavailable("no units match the include patterns"));
        }
        Ok(())
    }

    fn charts(&self) -> Charts {
        Charts::new()
    }

    async fn collect(&mut self, ctx: &JobContext, charts: &mut Charts) -> Result<MetricBag> {
        let units = self.list_units(ctx).await?;

        self.base.begin_cycle();
        let mut bag = MetricBag::new();
        for (unit, active) in &units {
            let values: Vec<(&str, i64)> = STATES
                .iter()
                .map(|state| (*state, i64::from(*state == active.as_str())))
                .collect();
            let chart_id = crate::contexts::set(
                charts,
                &mut bag,
                &contexts::UNIT_STATE,
                &[("unit_name", unit.as_str())],
                &values,
            )?;
            if self.base.mark_seen(&chart_id) {
                debug!(unit = %unit, "New systemd unit");
            }
        }

        for chart_id in self.base.take_vanished() {
            debug!(chart = %chart_id, "systemd unit vanished");
            if charts.contains(&chart_id) {
                charts
                    .mark_obsolete(&chart_id)
                    .map_err(|e| CollectorError::internal(e.to_string()))?;
            }
        }

        Ok(bag)
    }
}
