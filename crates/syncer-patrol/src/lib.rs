//! Patrol engine: structural diff of tenant and super state, and the
//! periodic patroller driving it
//!
//! A patrol pass lists every tenant cluster and the super-side cache, builds a
//! [`differ::DiffSet`] for each side and dispatches the differences to a
//! kind-specific [`differ::DifferenceHandler`] behind a
//! [`differ::KnownClusterFilter`], so objects owned by clusters that could not
//! be listed this pass are never mistaken for orphans.

#![deny(missing_docs)]

pub mod differ;
pub mod patroller;

pub use differ::{
    ClusterObject, ClusterObjectKey, DiffSet, DifferenceHandler, FilteringHandler,
    KnownClusterFilter, ObjectFilter,
};
pub use patroller::{
    take_snapshot, PatrolDo, PatrolOptions, PatrolSnapshot, PatrolStats, PatrolSummary, Patroller,
};
