//! Per-resource downward-sync controllers and their patrol handlers
//!
//! Every synced kind shares one engine, [`dws::DownwardSyncer`], parameterized
//! by the kind's [`rules::SyncRules`]: how a tenant object is projected, how a
//! live projection is brought up to date, and what the patrol treats as drift.
//! [`registry::builtin_resources`] lists the kinds the binary can run.

#![deny(missing_docs)]

pub mod controller;
pub mod dws;
pub mod registry;
pub mod remedy;
pub mod rules;
pub mod service;
pub mod serviceaccount;

pub use controller::{BoxedTask, ControllerOptions};
pub use dws::{DownwardSyncer, SyncOutcome};
pub use registry::{
    builtin_resources, KindRuntime, ResourceKind, ResourceRegistration, ResourceSyncer,
    SyncerContext,
};
pub use rules::SyncRules;
pub use service::{ServiceRules, ServiceSyncer};
pub use serviceaccount::{ServiceAccountRules, ServiceAccountSyncer};
