//! Chart state of one job as seen by the parent
//!
//! The tracker remembers every chart the parent was told about, with the
//! dimensions it knows, and turns the module's current [`Charts`] plus a
//! [`MetricBag`] into CHART/DIMENSION/VARIABLE and BEGIN/SET/END lines.

use crate::confgroup::JobConfig;
use crate::module::{Chart, Charts, Dim, MetricBag};
use crate::output::{ApiWriter, JobIdentity};
use std::collections::BTreeMap;
use tracing::debug;

/// How a live chart differs from what the parent knows
#[derive(Debug, PartialEq)]
enum Change<'a> {
    None,
    NewDims(Vec<&'a Dim>),
    Recreate,
}

#[derive(Debug)]
struct Entry {
    /// Definition the parent holds
    known: Chart,
    /// Obsoleted for lack of data; recreated when data shows up
    obsolete: bool,
    idle_cycles: u64,
}

#[derive(Debug)]
pub struct ChartTracker {
    ident: JobIdentity,
    /// Cycles without data before a chart is obsoleted; 0 disables
    obsolete_after: u64,
    entries: BTreeMap<String, Entry>,
}

impl ChartTracker {
    pub fn new(config: &JobConfig, obsolete_after: u64) -> Self {
        Self {
            ident: JobIdentity::new(config),
            obsolete_after,
            entries: BTreeMap::new(),
        }
    }

    /// Charts the parent currently draws
    pub fn live(&self) -> usize {
        self.entries.values().filter(|e| !e.obsolete).count()
    }

    pub fn is_tracked(&self, chart_id: &str) -> bool {
        self.entries.contains_key(chart_id)
    }

    /// Bring the parent's definitions in line with `charts` without data.
    /// Used for the announce phase.
    pub fn announce(&mut self, charts: &mut Charts, out: &mut ApiWriter) {
        self.sync(charts, None, out);
        charts.remove_obsolete();
    }

    /// One collection cycle: definitions first, then data.
    pub fn cycle(&mut self, charts: &mut Charts, bag: &MetricBag, out: &mut ApiWriter) {
        self.sync(charts, Some(bag), out);
        self.expire(charts, bag, out);

        for chart in charts.iter() {
            let Some(entry) = self.entries.get(&chart.id) else {
                continue;
            };
            if entry.obsolete || !has_data(chart, bag) {
                continue;
            }
            out.begin(&self.ident, &chart.id);
            for dim in entry.known.dims() {
                match bag.get(&dim.key) {
                    Some(value) => out.set(&dim.id, value),
                    None => out.set_empty(&dim.id),
                }
            }
            out.end();
        }

        charts.remove_obsolete();
    }

    /// Obsolete every chart the parent still draws and forget them all
    pub fn obsolete_all(&mut self, out: &mut ApiWriter) {
        for entry in self.entries.values().filter(|e| !e.obsolete) {
            write_obsolete(&self.ident, &entry.known, out);
        }
        self.entries.clear();
    }

    fn sync(&mut self, charts: &Charts, bag: Option<&MetricBag>, out: &mut ApiWriter) {
        for chart in charts.iter() {
            if chart.is_obsolete() {
                if let Some(entry) = self.entries.remove(&chart.id) {
                    if !entry.obsolete {
                        write_obsolete(&self.ident, &entry.known, out);
                    }
                }
                continue;
            }

            let Some(entry) = self.entries.get_mut(&chart.id) else {
                write_definition(&self.ident, chart, out);
                self.entries.insert(
                    chart.id.clone(),
                    Entry {
                        known: chart.clone(),
                        obsolete: false,
                        idle_cycles: 0,
                    },
                );
                continue;
            };

            if entry.obsolete {
                if bag.is_some_and(|bag| has_data(chart, bag)) {
                    debug!(chart = %chart.id, "recreating chart after data returned");
                    write_definition(&self.ident, chart, out);
                    entry.known = chart.clone();
                    entry.obsolete = false;
                    entry.idle_cycles = 0;
                }
                continue;
            }

            match diff(&entry.known, chart) {
                Change::None => {}
                Change::NewDims(dims) => {
                    out.chart(&self.ident, chart);
                    for dim in dims {
                        out.dimension(dim);
                    }
                    entry.known = chart.clone();
                }
                Change::Recreate => {
                    debug!(chart = %chart.id, "chart definition changed, recreating");
                    write_obsolete(&self.ident, &entry.known, out);
                    write_definition(&self.ident, chart, out);
                    entry.known = chart.clone();
                    entry.idle_cycles = 0;
                }
            }
        }
    }

    /// Obsolete charts that went without data for the whole window
    fn expire(&mut self, charts: &Charts, bag: &MetricBag, out: &mut ApiWriter) {
        for chart in charts.iter() {
            let Some(entry) = self.entries.get_mut(&chart.id) else {
                continue;
            };
            if entry.obsolete {
                continue;
            }
            if has_data(chart, bag) {
                entry.idle_cycles = 0;
                continue;
            }
            entry.idle_cycles += 1;
            if self.obsolete_after > 0 && entry.idle_cycles >= self.obsolete_after {
                debug!(chart = %chart.id, cycles = entry.idle_cycles, "chart went stale");
                write_obsolete(&self.ident, &entry.known, out);
                entry.obsolete = true;
            }
        }
    }
}

fn has_data(chart: &Chart, bag: &MetricBag) -> bool {
    chart.dims().iter().any(|d| bag.contains(&d.key))
}

fn diff<'a>(known: &Chart, current: &'a Chart) -> Change<'a> {
    let header_changed = known.title != current.title
        || known.units != current.units
        || known.family != current.family
        || known.context != current.context
        || known.chart_type != current.chart_type;
    if header_changed {
        return Change::Recreate;
    }

    for dim in known.dims() {
        match current.dim(&dim.id) {
            Some(now) if !now.semantics_differ(dim) => {}
            _ => return Change::Recreate,
        }
    }

    let added: Vec<&Dim> = current
        .dims()
        .iter()
        .filter(|d| !known.has_dim(&d.id))
        .collect();
    if added.is_empty() {
        Change::None
    } else {
        Change::NewDims(added)
    }
}

fn write_definition(ident: &JobIdentity, chart: &Chart, out: &mut ApiWriter) {
    out.chart(ident, chart);
    for dim in chart.dims() {
        out.dimension(dim);
    }
    for var in chart.vars() {
        out.variable(var);
    }
}

fn write_obsolete(ident: &JobIdentity, chart: &Chart, out: &mut ApiWriter) {
    let mut gone = chart.clone();
    gone.mark_obsolete();
    out.chart(ident, &gone);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{DimAlgorithm, Var};

    fn tracker(obsolete_after: u64) -> ChartTracker {
        let mut config = JobConfig::new("demo", "local");
        config.update_every = 2;
        ChartTracker::new(&config, obsolete_after)
    }

    fn requests() -> Chart {
        Chart::new("requests", "Requests", "requests/s")
            .family("http")
            .context("demo.requests")
            .with_dim(Dim::new("ok").incremental())
            .with_dim(Dim::new("failed").incremental())
            .with_var(Var::new("limit", 100))
    }

    fn charts_of(list: Vec<Chart>) -> Charts {
        let mut charts = Charts::new();
        charts.add_all(list).unwrap();
        charts
    }

    fn lines(out: ApiWriter) -> Vec<String> {
        out.into_string().lines().map(str::to_string).collect()
    }

    #[test]
    fn test_announce_then_data() {
        let mut t = tracker(0);
        let mut charts = charts_of(vec![requests()]);

        let mut out = ApiWriter::new();
        t.announce(&mut charts, &mut out);
        assert_eq!(
            lines(out),
            vec![
                "CHART 'demo.requests_local' '' 'Requests' 'requests/s' 'http' 'demo.requests' 0 70000 2 '' 'demo' 'local'",
                "DIMENSION 'ok' 'ok' incremental 1 1 ''",
                "DIMENSION 'failed' 'failed' incremental 1 1 ''",
                "VARIABLE CHART 'limit' = 100",
            ]
        );

        let bag: MetricBag = [("ok", 10)].into_iter().collect();
        let mut out = ApiWriter::new();
        t.cycle(&mut charts, &bag, &mut out);
        assert_eq!(
            lines(out),
            vec![
                "BEGIN 'demo.requests_local'",
                "SET 'ok' = 10",
                "SET 'failed' =",
                "END",
            ]
        );
    }

    #[test]
    fn test_reannounce_is_silent() {
        let mut t = tracker(0);
        let mut charts = charts_of(vec![requests()]);
        t.announce(&mut charts, &mut ApiWriter::new());

        let mut out = ApiWriter::new();
        t.announce(&mut charts, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_chart_without_data_is_skipped() {
        let mut t = tracker(0);
        let mut charts = charts_of(vec![requests()]);
        t.announce(&mut charts, &mut ApiWriter::new());

        let mut out = ApiWriter::new();
        t.cycle(&mut charts, &MetricBag::new(), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_added_dim_emits_header_and_new_dim_only() {
        let mut t = tracker(0);
        let mut charts = charts_of(vec![requests()]);
        t.announce(&mut charts, &mut ApiWriter::new());

        charts
            .get_mut("requests")
            .unwrap()
            .add_dim(Dim::new("redirect").incremental())
            .unwrap();
        let bag: MetricBag = [("redirect", 1)].into_iter().collect();
        let mut out = ApiWriter::new();
        t.cycle(&mut charts, &bag, &mut out);

        let lines = lines(out);
        assert!(lines[0].starts_with("CHART 'demo.requests_local'"));
        assert!(!lines[0].contains("obsolete"));
        assert_eq!(lines[1], "DIMENSION 'redirect' 'redirect' incremental 1 1 ''");
        assert_eq!(lines[2], "BEGIN 'demo.requests_local'");
        assert_eq!(lines.iter().filter(|l| l.starts_with("DIMENSION")).count(), 1);
        assert_eq!(lines.last().unwrap(), "END");
    }

    #[test]
    fn test_units_change_recreates() {
        let mut t = tracker(0);
        let mut charts = charts_of(vec![requests()]);
        t.announce(&mut charts, &mut ApiWriter::new());

        charts.get_mut("requests").unwrap().units = "requests/min".into();
        let mut out = ApiWriter::new();
        t.cycle(&mut charts, &MetricBag::new(), &mut out);

        let lines = lines(out);
        assert!(lines[0].contains("'requests/s'"));
        assert!(lines[0].ends_with("'obsolete' 'demo' 'local'"));
        assert!(lines[1].contains("'requests/min'"));
        assert!(lines[1].ends_with("'' 'demo' 'local'"));
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn test_dim_algorithm_change_recreates() {
        let mut t = tracker(0);
        let mut charts = charts_of(vec![Chart::new("c", "C", "u").with_dim(Dim::new("a"))]);
        t.announce(&mut charts, &mut ApiWriter::new());

        charts.mark_obsolete("c").unwrap();
        charts
            .add(Chart::new("c", "C", "u").with_dim(Dim::new("a").algorithm(DimAlgorithm::Incremental)))
            .unwrap();
        let mut out = ApiWriter::new();
        t.cycle(&mut charts, &MetricBag::new(), &mut out);

        let lines = lines(out);
        assert!(lines[0].contains("'obsolete'"));
        assert_eq!(lines[2], "DIMENSION 'a' 'a' incremental 1 1 ''");
    }

    #[test]
    fn test_module_obsoleted_chart_is_dropped() {
        let mut t = tracker(0);
        let mut charts = charts_of(vec![requests(), Chart::new("other", "Other", "x").with_dim(Dim::new("x"))]);
        t.announce(&mut charts, &mut ApiWriter::new());

        charts.mark_obsolete("other").unwrap();
        let mut out = ApiWriter::new();
        t.cycle(&mut charts, &MetricBag::new(), &mut out);

        let lines = lines(out);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("CHART 'demo.other_local'"));
        assert!(lines[0].contains("'obsolete'"));
        assert!(!charts.contains("other"));
        assert!(!t.is_tracked("other"));

        // Re-adding the id produces a fresh CHART before any SET.
        charts
            .add(Chart::new("other", "Other", "x").with_dim(Dim::new("x")))
            .unwrap();
        let bag: MetricBag = [("x", 1)].into_iter().collect();
        let mut out = ApiWriter::new();
        t.cycle(&mut charts, &bag, &mut out);
        let lines: Vec<String> = self::lines(out);
        assert!(lines[0].starts_with("CHART 'demo.other_local'"));
        assert!(!lines[0].contains("obsolete"));
        assert_eq!(lines[2], "BEGIN 'demo.other_local'");
    }

    #[test]
    fn test_stale_chart_obsoleted_then_recreated() {
        let mut t = tracker(3);
        let mut charts = charts_of(vec![requests()]);
        t.announce(&mut charts, &mut ApiWriter::new());

        let empty = MetricBag::new();
        for _ in 0..2 {
            let mut out = ApiWriter::new();
            t.cycle(&mut charts, &empty, &mut out);
            assert!(out.is_empty());
        }

        let mut out = ApiWriter::new();
        t.cycle(&mut charts, &empty, &mut out);
        let stale = lines(out);
        assert_eq!(stale.len(), 1);
        assert!(stale[0].contains("'obsolete'"));
        assert_eq!(t.live(), 0);

        // still declared by the module, so data brings it back
        let bag: MetricBag = [("ok", 5)].into_iter().collect();
        let mut out = ApiWriter::new();
        t.cycle(&mut charts, &bag, &mut out);
        let back = lines(out);
        assert!(back[0].starts_with("CHART 'demo.requests_local'"));
        assert!(!back[0].contains("obsolete"));
        assert_eq!(back[1], "DIMENSION 'ok' 'ok' incremental 1 1 ''");
        assert!(back.contains(&"SET 'ok' = 5".to_string()));
        assert_eq!(t.live(), 1);
    }

    #[test]
    fn test_obsolete_all() {
        let mut t = tracker(0);
        let mut charts = charts_of(vec![requests(), Chart::new("b", "B", "x").with_dim(Dim::new("y"))]);
        t.announce(&mut charts, &mut ApiWriter::new());

        let mut out = ApiWriter::new();
        t.obsolete_all(&mut out);
        let lines = lines(out);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.contains("'obsolete'")));
        assert_eq!(t.live(), 0);

        let mut out = ApiWriter::new();
        t.obsolete_all(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_chart_update_every_override() {
        let mut t = tracker(0);
        let mut charts = charts_of(vec![Chart::new("slow", "Slow", "x").update_every(10).with_dim(Dim::new("v"))]);
        let mut out = ApiWriter::new();
        t.announce(&mut charts, &mut out);
        assert!(out.as_str().contains(" 70000 10 ''"));
    }

    #[test]
    fn test_job_priority_applies_to_charts_without_one() {
        let mut config = JobConfig::new("demo", "local");
        config.priority = 100;
        let mut t = ChartTracker::new(&config, 0);
        let mut charts = charts_of(vec![
            Chart::new("c", "C", "u").with_dim(Dim::new("v")),
            Chart::new("pinned", "P", "u").priority(2000).with_dim(Dim::new("v")),
        ]);

        let mut out = ApiWriter::new();
        t.announce(&mut charts, &mut out);
        let lines = lines(out);
        assert_eq!(lines[0], "CHART 'demo.c_local' '' 'C' 'u' '' '' 0 100 1 '' 'demo' 'local'");
        assert!(lines[2].starts_with("CHART 'demo.pinned_local' '' 'P' 'u' '' '' 0 2000 1 "));
    }

    #[test]
    fn test_dim_reads_bag_key_and_emits_local_id() {
        let mut t = tracker(0);
        let mut charts = charts_of(vec![Chart::new("rtt_a", "RTT", "ms").with_dim(Dim::new("min").key("a_min"))]);
        t.announce(&mut charts, &mut ApiWriter::new());

        let bag: MetricBag = [("a_min", 7), ("min", 99)].into_iter().collect();
        let mut out = ApiWriter::new();
        t.cycle(&mut charts, &bag, &mut out);
        assert_eq!(lines(out), vec!["BEGIN 'demo.rtt_a_local'", "SET 'min' = 7", "END"]);
    }
}
