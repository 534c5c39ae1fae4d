//! Per-cycle metric values

use std::collections::HashMap;

/// Values collected in one cycle, keyed by dimension id.
///
/// A dimension missing from the bag means "no data" and is emitted as an
/// empty SET, never as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricBag {
    values: HashMap<String, i64>,
}

impl MetricBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: impl Into<String>, value: i64) {
        self.values.insert(id.into(), value);
    }

    /// Add to an existing value, starting from zero
    pub fn add(&mut self, id: impl Into<String>, value: i64) {
        *self.values.entry(id.into()).or_insert(0) += value;
    }

    pub fn set_bool(&mut self, id: impl Into<String>, value: bool) {
        self.set(id, i64::from(value));
    }

    /// Store a float scaled by `precision` (e.g. 1000 for three decimals)
    pub fn set_float(&mut self, id: impl Into<String>, value: f64, precision: i64) {
        self.set(id, (value * precision as f64).round() as i64);
    }

    pub fn get(&self, id: &str) -> Option<i64> {
        self.values.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.values.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn extend(&mut self, other: MetricBag) {
        self.values.extend(other.values);
    }
}

impl<K: Into<String>> FromIterator<(K, i64)> for MetricBag {
    fn from_iter<I: IntoIterator<Item = (K, i64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
