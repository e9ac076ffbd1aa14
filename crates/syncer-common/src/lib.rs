//! Common types for the tenant syncer: errors, naming scheme, collaborator traits

#![deny(missing_docs)]

pub mod conversion;
pub mod error;
pub mod kube_utils;
pub mod mc;
pub mod metrics;
pub mod telemetry;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Prefix shared by every label and annotation the syncer owns
pub const TENANCY_PREFIX: &str = "tenancy.x-k8s.io/";

/// Annotation recording the cluster key of the tenant that owns a projection
pub const LABEL_CLUSTER: &str = "tenancy.x-k8s.io/cluster";

/// Annotation recording the UID of the tenant object behind a projection
pub const LABEL_UID: &str = "tenancy.x-k8s.io/uid";

/// Annotation recording the tenant-side namespace of a projection
pub const LABEL_NAMESPACE: &str = "tenancy.x-k8s.io/namespace";

/// Label marking super-side objects created by this syncer
pub const LABEL_CONTROLLED_BY: &str = "tenancy.x-k8s.io/controlled-by";

/// Value of [`LABEL_CONTROLLED_BY`] on projected objects
pub const CONTROLLED_BY_SYNCER: &str = "vc-syncer";
