//! Core library for keeping per-directory XFS project quotas in sync with
//! the home directories that exist on disk.
//!
//! Each reconciliation cycle discovers directories under the configured
//! roots, keeps the `/etc/projid` and `/etc/projects` registry files in step
//! with them, and applies the desired limits through `xfs_quota`.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration and command-line overlay
//! - [`discovery`]: home directory discovery
//! - [`registry`]: path ↔ project id registry files
//! - [`quota`]: quota subsystem adapter (`xfs_quota` and in-memory)
//! - [`engine`]: the reconciliation cycle
//! - [`metrics`]: Prometheus gauges for applied quotas

pub mod config;
pub mod discovery;
pub mod engine;
pub mod metrics;
pub mod quota;
pub mod registry;

pub use config::QuotaConfig;
pub use engine::{CycleReport, Engine, EngineError};
