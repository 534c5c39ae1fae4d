//! YAML job file loader
//!
//! A job file has optional top-level defaults (`update_every`,
//! `autodetection_retry`, `priority` and any module option) and a `jobs`
//! sequence. Each job map is merged over the top-level map.

use crate::confgroup::{ConfGroup, Defaults, DefaultsLookup, JobConfig};
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// File extensions picked up when a configured path is a directory
pub const RECOGNISED_EXTENSIONS: &[&str] = &["yaml", "yml", "conf"];

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid job file {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
}

/// Source id of the group built from `path`
pub fn source_id(path: &Path) -> String {
    format!("file={}", path.display())
}

/// Whether `path` has a job file extension
pub fn is_job_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| RECOGNISED_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Expand configured paths into job files.
///
/// Directories contribute their recognised files (sorted, non-recursive).
/// Explicit file paths are kept even when missing so the caller can emit an
/// empty group for them.
pub async fn expand_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for path in paths {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {
                let mut entries = match tokio::fs::read_dir(path).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to list config directory");
                        continue;
                    }
                };
                let mut found = Vec::new();
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let file = entry.path();
                    if is_job_file(&file) {
                        found.push(file);
                    }
                }
                found.sort();
                files.extend(found);
            }
            Ok(_) => files.push(path.clone()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && is_job_file(path) => {
                files.push(path.clone())
            }
            Err(e) => debug!(path = %path.display(), error = %e, "Skipping config path"),
        }
    }

    files
}

/// Read and parse one job file.
///
/// A missing file yields an empty group for its source.
pub async fn load_file(path: &Path, defaults: &dyn DefaultsLookup) -> Result<ConfGroup, LoadError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_conf_group(path, &content, defaults),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(ConfGroup::empty(source_id(path)))
        }
        Err(source) => Err(LoadError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Parse job file content into a [`ConfGroup`].
///
/// Jobs lacking a name or module are skipped with a warning; a document that
/// is not valid YAML, or whose shape is wrong, fails the whole source.
pub fn parse_conf_group(
    path: &Path,
    content: &str,
    defaults: &dyn DefaultsLookup,
) -> Result<ConfGroup, LoadError> {
    let source = source_id(path);
    if content.trim().is_empty() {
        return Ok(ConfGroup::empty(source));
    }

    let document: Value = serde_yaml::from_str(content).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut top = match document {
        Value::Mapping(map) => map,
        Value::Null => return Ok(ConfGroup::empty(source)),
        _ => {
            return Err(LoadError::Invalid {
                path: path.to_path_buf(),
                reason: "top level must be a map".into(),
            })
        }
    };

    let jobs = match top.remove("jobs") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(jobs)) => jobs,
        Some(_) => {
            return Err(LoadError::Invalid {
                path: path.to_path_buf(),
                reason: "'jobs' must be a sequence".into(),
            })
        }
    };

    let file_module = path.file_stem().and_then(|stem| stem.to_str());
    let mut seen = HashSet::new();
    let mut configs = Vec::with_capacity(jobs.len());

    for (index, item) in jobs.into_iter().enumerate() {
        let Value::Mapping(job) = item else {
            warn!(path = %path.display(), index, "Skipping job that is not a map");
            continue;
        };

        match build_job(&job, &top, file_module, &source, defaults) {
            Ok(config) => {
                if !seen.insert(config.key()) {
                    warn!(
                        path = %path.display(),
                        job = %config.key(),
                        "Skipping duplicate job"
                    );
                    continue;
                }
                configs.push(config);
            }
            Err(reason) => {
                warn!(path = %path.display(), index, reason = %reason, "Skipping invalid job")
            }
        }
    }

    Ok(ConfGroup::new(source, configs))
}

fn build_job(
    job: &Mapping,
    top: &Mapping,
    file_module: Option<&str>,
    source: &str,
    defaults: &dyn DefaultsLookup,
) -> Result<JobConfig, String> {
    let module = match job.get("module").or_else(|| top.get("module")) {
        Some(Value::String(module)) if !module.trim().is_empty() => module.trim().to_string(),
        Some(_) => return Err("'module' must be a non-empty string".into()),
        None => file_module
            .map(str::to_string)
            .ok_or_else(|| "missing 'module'".to_string())?,
    };

    let name = match job.get("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err("missing 'name'".into()),
    };

    let fallback = defaults.defaults_for(&module).unwrap_or_else(Defaults::default);
    let layers = [job, top];

    let update_every = resolve(&layers, "update_every", fallback.update_every, |v| {
        v.as_u64().filter(|n| *n > 0)
    });
    let autodetection_retry = resolve(
        &layers,
        "autodetection_retry",
        fallback.autodetection_retry,
        Value::as_u64,
    );
    let priority = resolve(&layers, "priority", fallback.priority, Value::as_i64);

    let mut options = top.clone();
    for (key, value) in job {
        options.insert(key.clone(), value.clone());
    }

    Ok(JobConfig {
        module,
        name,
        update_every,
        autodetection_retry,
        priority,
        source: source.to_string(),
        options,
    })
}

/// First valid value of `key` across the layers, else `fallback`
fn resolve<T>(layers: &[&Mapping], key: &str, fallback: T, parse: impl Fn(&Value) -> Option<T>) -> T {
    for layer in layers {
        if let Some(value) = layer.get(key) {
            match parse(value) {
                Some(parsed) => return parsed,
                None => warn!(key, value = ?value, "Ignoring invalid value"),
            }
        }
    }
    fallback
}
