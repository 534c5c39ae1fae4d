//! Collector agent process: configuration and the self-telemetry API

pub mod api;
pub mod config;
