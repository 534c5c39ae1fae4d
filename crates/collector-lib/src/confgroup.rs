//! Job configuration records exchanged between discovery and the job manager

use crate::error::{CollectorError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_UPDATE_EVERY: u64 = 1;
pub const DEFAULT_AUTODETECTION_RETRY: u64 = 0;
pub const DEFAULT_PRIORITY: i64 = 70000;

/// Per-module defaults applied when neither the job nor its file sets a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    pub update_every: u64,
    pub autodetection_retry: u64,
    pub priority: i64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            update_every: DEFAULT_UPDATE_EVERY,
            autodetection_retry: DEFAULT_AUTODETECTION_RETRY,
            priority: DEFAULT_PRIORITY,
        }
    }
}

/// Lookup of module defaults, implemented by the module registry
pub trait DefaultsLookup: Send + Sync {
    fn defaults_for(&self, module: &str) -> Option<Defaults>;
}

/// Identity of a job: (module, job name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobKey {
    pub module: String,
    pub name: String,
}

impl JobKey {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.module, self.name)
    }
}

/// A single job definition
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    pub module: String,
    pub name: String,
    /// Seconds between collections
    pub update_every: u64,
    /// Number of check retries for retryable failures
    pub autodetection_retry: u64,
    pub priority: i64,
    /// Source id of the group that produced this config
    pub source: String,
    /// Merged option map as written in the file, module options included
    pub options: serde_yaml::Mapping,
}

impl JobConfig {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        let defaults = Defaults::default();
        Self {
            module: module.into(),
            name: name.into(),
            update_every: defaults.update_every,
            autodetection_retry: defaults.autodetection_retry,
            priority: defaults.priority,
            source: String::new(),
            options: serde_yaml::Mapping::new(),
        }
    }

    /// Set a free-form option, returning self for chaining
    pub fn with_option(mut self, key: &str, value: impl Into<serde_yaml::Value>) -> Self {
        self.options
            .insert(serde_yaml::Value::String(key.to_string()), value.into());
        self
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(&self.module, &self.name)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_every.max(1))
    }

    /// Decode the option map into a module's typed option record.
    ///
    /// Unknown keys are ignored; missing required keys and type mismatches
    /// become [`CollectorError::Config`].
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_yaml::from_value(serde_yaml::Value::Mapping(self.options.clone())).map_err(|e| {
            CollectorError::config(format!("job '{}' options: {}", self.key(), e))
        })
    }
}

/// Snapshot of all job configs produced by one source.
///
/// A newer group for the same source replaces the previous one entirely.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfGroup {
    pub source: String,
    pub configs: Vec<JobConfig>,
}

impl ConfGroup {
    pub fn new(source: impl Into<String>, configs: Vec<JobConfig>) -> Self {
        Self {
            source: source.into(),
            configs,
        }
    }

    /// An empty group, which removes every job of the source
    pub fn empty(source: impl Into<String>) -> Self {
        Self::new(source, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Opts {
        url: String,
        #[serde(default)]
        retries: u32,
    }

    #[test]
    fn test_decode_options() {
        let cfg = JobConfig::new("elasticsearch", "local")
            .with_option("url", "http://127.0.0.1:9200")
            .with_option("unknown", 5);
        let opts: Opts = cfg.decode().unwrap();
        assert_eq!(opts.url, "http://127.0.0.1:9200");
        assert_eq!(opts.retries, 0);
    }

    #[test]
    fn test_decode_missing_required_is_config_error() {
        let cfg = JobConfig::new("elasticsearch", "local");
        let err = cfg.decode::<Opts>().unwrap_err();
        assert!(matches!(err, CollectorError::Config(_)));
    }

    #[test]
    fn test_update_interval_never_zero() {
        let mut cfg = JobConfig::new("m", "j");
        cfg.update_every = 0;
        assert_eq!(cfg.update_interval(), Duration::from_secs(1));
    }
}
