//! Serde helpers for module option records
//!
//! Used with `#[serde(with = "...")]` / `deserialize_with` on option
//! structs decoded by [`JobConfig::decode`](crate::confgroup::JobConfig::decode).

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Secs(u64),
    Float(f64),
    Text(String),
}

fn parse_duration(raw: RawDuration) -> Result<Duration, String> {
    match raw {
        RawDuration::Secs(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Float(secs) if secs.is_finite() && secs >= 0.0 => {
            Ok(Duration::from_secs_f64(secs))
        }
        RawDuration::Float(secs) => Err(format!("invalid duration {secs}")),
        RawDuration::Text(text) => {
            let text = text.trim();
            if let Ok(secs) = text.parse::<f64>() {
                return parse_duration(RawDuration::Float(secs));
            }
            humantime::parse_duration(text).map_err(|e| format!("invalid duration '{text}': {e}"))
        }
    }
}

/// Durations written as integer/float seconds or humantime strings (`"250ms"`)
pub mod duration {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawDuration::deserialize(deserializer)?;
        parse_duration(raw).map_err(D::Error::custom)
    }
}

/// Optional variant of [`duration`]; use with `#[serde(default)]`
pub mod option_duration {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<RawDuration>::deserialize(deserializer)?;
        raw.map(parse_duration)
            .transpose()
            .map_err(D::Error::custom)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawList {
    One(String),
    Many(Vec<String>),
}

/// A string list that also accepts a single scalar string
pub mod string_list {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<RawList>::deserialize(deserializer)? {
            None => Vec::new(),
            Some(RawList::One(item)) => vec![item],
            Some(RawList::Many(items)) => items,
        })
    }
}
