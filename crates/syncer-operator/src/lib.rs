//! Tenant syncer binary support: configuration and the per-kind task set
//! the binary drives.

#![deny(missing_docs)]

pub mod config;
pub mod engine;

pub use config::{ConfigError, SyncerConfig, TenantConfig};
pub use engine::{build_engine, build_kind_tasks, select_resources};
