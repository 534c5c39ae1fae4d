//! Line protocol writer
//!
//! Builds one job's directive block in memory; the [`Emitter`](super::Emitter)
//! writes the finished block atomically.

use crate::confgroup::JobConfig;
use crate::module::{Chart, Dim, Var};
use std::fmt::Write;

/// Quoted fields cannot carry single quotes
fn quote(value: &str) -> String {
    value.replace('\'', "\"")
}

/// What every CHART line of one job shares.
///
/// The chart type is the module name; jobs are told apart by a job suffix
/// on the chart id, which is left off when the job is named after its module.
#[derive(Debug, Clone)]
pub struct JobIdentity {
    pub module: String,
    pub job: String,
    pub update_every: u64,
    /// Used by charts that declare no priority of their own
    pub priority: i64,
}

impl JobIdentity {
    pub fn new(config: &JobConfig) -> Self {
        Self {
            module: config.module.clone(),
            job: config.name.clone(),
            update_every: config.update_every.max(1),
            priority: config.priority,
        }
    }

    /// `<type>.<id>` of a chart as the parent knows it
    pub fn chart_ref(&self, chart_id: &str) -> String {
        if self.job == self.module {
            format!("{}.{}", self.module, chart_id)
        } else {
            format!("{}.{}_{}", self.module, chart_id, self.job)
        }
    }
}

/// Accumulates protocol lines for one job and one cycle
#[derive(Debug, Default)]
pub struct ApiWriter {
    buf: String,
}

impl ApiWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chart(&mut self, ident: &JobIdentity, chart: &Chart) {
        let _ = writeln!(
            self.buf,
            "CHART '{}' '' '{}' '{}' '{}' '{}' {} {} {} '{}' '{}' '{}'",
            ident.chart_ref(&chart.id),
            quote(&chart.title),
            quote(&chart.units),
            quote(&chart.family),
            quote(&chart.context),
            chart.chart_type.code(),
            chart.priority.unwrap_or(ident.priority),
            chart.update_every.unwrap_or(ident.update_every),
            chart.opts.flags(),
            quote(&ident.module),
            quote(&ident.job),
        );
    }

    pub fn dimension(&mut self, dim: &Dim) {
        let _ = writeln!(
            self.buf,
            "DIMENSION '{}' '{}' {} {} {} '{}'",
            dim.id,
            quote(&dim.name),
            dim.algorithm.as_str(),
            dim.multiplier,
            dim.divisor,
            if dim.hidden { "hidden" } else { "" },
        );
    }

    pub fn variable(&mut self, var: &Var) {
        let _ = writeln!(self.buf, "VARIABLE CHART '{}' = {}", var.id, var.value);
    }

    pub fn begin(&mut self, ident: &JobIdentity, chart_id: &str) {
        let _ = writeln!(self.buf, "BEGIN '{}'", ident.chart_ref(chart_id));
    }

    pub fn set(&mut self, dim_id: &str, value: i64) {
        let _ = writeln!(self.buf, "SET '{dim_id}' = {value}");
    }

    /// `SET` without a value: the dimension has no data this cycle
    pub fn set_empty(&mut self, dim_id: &str) {
        let _ = writeln!(self.buf, "SET '{dim_id}' =");
    }

    pub fn end(&mut self) {
        self.buf.push_str("END\n");
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}
