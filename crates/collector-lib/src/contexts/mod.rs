//! Declarative chart contexts for labelled instances
//!
//! Modules that create one chart per entity (a host, a queue, a unit)
//! describe the chart once as a [`ContextDef`] and call [`set`] with the
//! entity's labels every cycle. Definitions are generated with
//! [`define_contexts!`](crate::define_contexts).

mod slug;

pub use slug::slugify;

use crate::error::{CollectorError, Result};
use crate::module::{Chart, ChartType, Charts, Dim, DimAlgorithm, MetricBag};

/// Dimension template of a context
#[derive(Debug)]
pub struct DimDef {
    pub id: &'static str,
    pub algorithm: DimAlgorithm,
    pub mul: i64,
    pub div: i64,
}

/// Chart template keyed by a dotted context name
#[derive(Debug)]
pub struct ContextDef {
    pub context: &'static str,
    pub title: &'static str,
    pub units: &'static str,
    pub family: &'static str,
    pub chart_type: ChartType,
    pub priority: i64,
    /// Label keys, in the order their values form the instance id
    pub labels: &'static [&'static str],
    pub dims: &'static [DimDef],
}

impl ContextDef {
    /// Label values in key order, joined with `_` and slugified
    pub fn instance_id(&self, labels: &[(&str, &str)]) -> Result<String> {
        let mut values = Vec::with_capacity(self.labels.len());
        for key in self.labels {
            let value = labels
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| *v)
                .ok_or_else(|| {
                    CollectorError::internal(format!(
                        "context {} is missing label '{}'",
                        self.context, key
                    ))
                })?;
            values.push(value);
        }
        Ok(slugify(&values.join("_")))
    }

    /// Chart id: the context name after its module prefix, plus the instance
    pub fn chart_id(&self, instance: &str) -> String {
        let suffix = self
            .context
            .split_once('.')
            .map(|(_, rest)| rest)
            .unwrap_or(self.context);
        let suffix = slugify(suffix);
        if instance.is_empty() {
            suffix
        } else {
            format!("{suffix}_{instance}")
        }
    }

    /// Metric bag key of one dimension of an instance
    pub fn dim_key(&self, instance: &str, dim: &str) -> String {
        if instance.is_empty() {
            dim.to_string()
        } else {
            format!("{instance}_{dim}")
        }
    }

    /// Materialise the chart for an instance
    pub fn chart(&self, instance: &str) -> Chart {
        self.dims.iter().fold(
            Chart::new(self.chart_id(instance), self.title, self.units)
                .family(self.family)
                .context(self.context)
                .chart_type(self.chart_type)
                .priority(self.priority),
            |chart, def| {
                chart.with_dim(
                    Dim::new(def.id)
                        .key(self.dim_key(instance, def.id))
                        .algorithm(def.algorithm)
                        .mul(def.mul)
                        .div(def.div),
                )
            },
        )
    }

    fn has_dim(&self, id: &str) -> bool {
        self.dims.iter().any(|d| d.id == id)
    }
}

/// Write an instance's values, admitting its chart on first use.
///
/// Returns the chart id.
pub fn set(
    charts: &mut Charts,
    bag: &mut MetricBag,
    def: &ContextDef,
    labels: &[(&str, &str)],
    values: &[(&str, i64)],
) -> Result<String> {
    let instance = def.instance_id(labels)?;
    set_instance(charts, bag, def, &instance, values)
}

/// [`set`] for an instance id computed by the caller. An empty id names the
/// job's only instance: the chart id is the bare context suffix.
pub fn set_instance(
    charts: &mut Charts,
    bag: &mut MetricBag,
    def: &ContextDef,
    instance: &str,
    values: &[(&str, i64)],
) -> Result<String> {
    let chart_id = def.chart_id(instance);

    if charts.get(&chart_id).map_or(true, |c| c.is_obsolete()) {
        charts
            .add(def.chart(instance))
            .map_err(|e| CollectorError::internal(e.to_string()))?;
    }

    for (dim, value) in values {
        if !def.has_dim(dim) {
            return Err(CollectorError::internal(format!(
                "context {} has no dimension '{}'",
                def.context, dim
            )));
        }
        bag.set(def.dim_key(instance, dim), *value);
    }

    Ok(chart_id)
}

/// Generate static [`ContextDef`]s plus a `CONTEXTS` table listing them.
///
/// ```ignore
/// define_contexts! {
///     QUEUE_DEPTH = {
///         context: "mq.queue_depth",
///         title: "Queue depth",
///         units: "messages",
///         family: "queues",
///         chart_type: Line,
///         priority: 1000,
///         labels: ["queue"],
///         dims: [("depth", Absolute, 1, 1)],
///     };
/// }
/// ```
#[macro_export]
macro_rules! define_contexts {
    ($(
        $name:ident = {
            context: $context:literal,
            title: $title:literal,
            units: $units:literal,
            family: $family:literal,
            chart_type: $chart_type:ident,
            priority: $priority:expr,
            labels: [$($label:literal),* $(,)?],
            dims: [$(($dim:literal, $algorithm:ident, $mul:expr, $div:expr)),* $(,)?] $(,)?
        };
    )+) => {
        $(
            pub static $name: $crate::contexts::ContextDef = $crate::contexts::ContextDef {
                context: $context,
                title: $title,
                units: $units,
                family: $family,
                chart_type: $crate::module::ChartType::$chart_type,
                priority: $priority,
                labels: &[$($label),*],
                dims: &[$($crate::contexts::DimDef {
                    id: $dim,
                    algorithm: $crate::module::DimAlgorithm::$algorithm,
                    mul: $mul,
                    div: $div,
                }),*],
            };
        )+

        pub static CONTEXTS: &[&$crate::contexts::ContextDef] = &[$(&$name),+];
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    mod fixtures {
        crate::define_contexts! {
            HOST_RTT = {
                context: "ping.host_rtt",
                title: "Ping round-trip time",
                units: "milliseconds",
                family: "latency",
                chart_type: Line,
                priority: 1000,
                labels: ["host"],
                dims: [("min", Absolute, 1, 1000), ("max", Absolute, 1, 1000)],
            };
            QUEUE_MESSAGES = {
                context: "mq.queue_messages",
                title: "Queue messages",
                units: "messages/s",
                family: "queues",
                chart_type: Area,
                priority: 2000,
                labels: ["qmgr", "queue"],
                dims: [("put", Incremental, 1, 1)],
            };
        }
    }

    use fixtures::{CONTEXTS, HOST_RTT, QUEUE_MESSAGES};

    #[test]
    fn test_generated_table() {
        assert_eq!(CONTEXTS.len(), 2);
        assert_eq!(CONTEXTS[0].context, "ping.host_rtt");
        assert_eq!(QUEUE_MESSAGES.chart_type, ChartType::Area);
    }

    #[test]
    fn test_instance_id_follows_label_key_order() {
        let id = QUEUE_MESSAGES
            .instance_id(&[("queue", "DEV.QUEUE.1"), ("qmgr", "QM1")])
            .unwrap();
        assert_eq!(id, "qm1_dev_queue_1");
        assert!(QUEUE_MESSAGES.instance_id(&[("queue", "x")]).is_err());
    }

    #[test]
    fn test_set_admits_chart_once() {
        let mut charts = Charts::new();
        let mut bag = MetricBag::new();

        let id = set(
            &mut charts,
            &mut bag,
            &HOST_RTT,
            &[("host", "127.0.0.1")],
            &[("min", 120), ("max", 450)],
        )
        .unwrap();
        assert_eq!(id, "host_rtt_127_0_0_1");

        set(&mut charts, &mut bag, &HOST_RTT, &[("host", "127.0.0.1")], &[("min", 100)]).unwrap();
        assert_eq!(charts.len(), 1);

        let chart = charts.get(&id).unwrap();
        assert_eq!(chart.context, "ping.host_rtt");
        assert_eq!(chart.dims()[0].id, "min");
        assert_eq!(chart.dims()[0].key, "127_0_0_1_min");
        assert_eq!(chart.dims()[0].name, "min");
        assert_eq!(chart.dims()[0].divisor, 1000);
        assert_eq!(bag.get("127_0_0_1_min"), Some(100));
        assert_eq!(bag.get("127_0_0_1_max"), Some(450));
    }

    #[test]
    fn test_set_rejects_unknown_dim() {
        let mut charts = Charts::new();
        let mut bag = MetricBag::new();
        let err = set(&mut charts, &mut bag, &HOST_RTT, &[("host", "h")], &[("avg", 1)]);
        assert!(err.is_err());
    }

    #[test]
    fn test_single_instance_uses_bare_ids() {
        let mut charts = Charts::new();
        let mut bag = MetricBag::new();

        let id = set_instance(&mut charts, &mut bag, &HOST_RTT, "", &[("min", 3)]).unwrap();
        assert_eq!(id, "host_rtt");
        assert_eq!(charts.get(&id).unwrap().dims()[1].key, "max");
        assert_eq!(bag.get("min"), Some(3));
    }
}
