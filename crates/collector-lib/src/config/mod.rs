//! Job configuration loading
//!
//! - [`loader`] turns YAML job files into [`ConfGroup`](crate::confgroup::ConfGroup)s
//! - [`decode`] holds serde helpers for typed module option records

pub mod decode;
pub mod loader;

pub use loader::{expand_paths, is_job_file, load_file, parse_conf_group, source_id, LoadError};
