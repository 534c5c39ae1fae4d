//! Collector runtime library
//!
//! This crate provides:
//! - Job config discovery from files and directories
//! - A registry of collector modules and their defaults
//! - Job lifecycle management with strike-based failure handling
//! - The chart/dimension line protocol written to the parent agent
//! - Shared HTTP, exec, socket, ICMP and PCF clients for modules
//! - Health checks and observability

pub mod clients;
pub mod confgroup;
pub mod config;
pub mod contexts;
pub mod discovery;
pub mod error;
pub mod health;
pub mod job;
pub mod jobmgr;
pub mod module;
pub mod modules;
pub mod observability;
pub mod output;
pub mod registry;
pub mod runtime;

pub use confgroup::{ConfGroup, JobConfig, JobKey};
pub use error::{CollectorError, ErrorKind};
pub use health::{Component, HealthBoard, Readiness, Snapshot, Status};
pub use job::{JobSettings, JobState, JobStatus, StatusTable};
pub use observability::{RuntimeMetrics, StructuredLogger};
pub use registry::{Creator, Registry};
pub use runtime::{Runtime, RuntimeOptions};
