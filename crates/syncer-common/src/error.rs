//! Error types for the tenant syncer
//!
//! Errors carry the object coordinates they relate to so a reconcile failure
//! logged by a controller can be traced back to one tenant object without
//! additional context.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for syncer operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that did not map onto a more specific variant
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The super-side object exists but was projected from another tenant object
    #[error(
        "{kind} {namespace}/{name} exists but its delegated UID is different \
         (tenant UID {expected_uid}, delegated UID {found_uid})"
    )]
    OwnershipConflict {
        /// Resource kind (e.g. "Service")
        kind: String,
        /// Super-side namespace of the conflicting object
        namespace: String,
        /// Name of the conflicting object
        name: String,
        /// UID of the tenant object being reconciled
        expected_uid: String,
        /// UID recorded in the super-side delegated UID annotation
        found_uid: String,
    },

    /// Object does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Namespace that was looked up
        namespace: String,
        /// Name that was looked up
        name: String,
    },

    /// Object already exists
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Namespace of the existing object
        namespace: String,
        /// Name of the existing object
        name: String,
    },

    /// A delete or update precondition (UID, resourceVersion) did not hold
    #[error("precondition failed for {kind} {namespace}/{name}: {message}")]
    PreconditionFailed {
        /// Resource kind
        kind: String,
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
        /// Server-reported reason
        message: String,
    },

    /// Listing a tenant cluster failed
    #[error("failed to list {kind} in cluster {cluster}: {message}")]
    ClusterList {
        /// Cluster key of the tenant that could not be listed
        cluster: String,
        /// Resource kind being listed
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// The cluster is not known to the multi-cluster controller
    #[error("cluster {cluster} is not registered")]
    UnknownCluster {
        /// Cluster key that was looked up
        cluster: String,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "tenants[0].uid")
        field: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "lister", "queue")
        context: String,
    },
}

impl Error {
    /// Create an ownership conflict between a projection and a tenant object
    pub fn ownership_conflict(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        expected_uid: impl Into<String>,
        found_uid: impl Into<String>,
    ) -> Self {
        Self::OwnershipConflict {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            expected_uid: expected_uid.into(),
            found_uid: found_uid.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a precondition failure
    pub fn precondition_failed(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::PreconditionFailed {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a tenant cluster listing error
    pub fn cluster_list(
        cluster: impl Into<String>,
        kind: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ClusterList {
            cluster: cluster.into(),
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error for a specific field
    pub fn config_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify a kube-rs error for an operation on one object.
    ///
    /// 404 becomes [`Error::NotFound`], 409 `AlreadyExists` becomes
    /// [`Error::AlreadyExists`], any other 409 becomes
    /// [`Error::PreconditionFailed`] (the API server reports UID and
    /// resourceVersion precondition mismatches as `Conflict`).
    pub fn from_kube(source: kube::Error, kind: &str, namespace: &str, name: &str) -> Self {
        match &source {
            kube::Error::Api(ae) if ae.code == 404 => Self::not_found(kind, namespace, name),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::already_exists(kind, namespace, name)
            }
            kube::Error::Api(ae) if ae.code == 409 => {
                Self::precondition_failed(kind, namespace, name, ae.message.clone())
            }
            _ => Self::Kube { source },
        }
    }

    /// Check if this error is retryable
    ///
    /// Ownership conflicts and configuration errors need an outside change
    /// before a retry can succeed; everything else may be transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 429
            ),
            Error::OwnershipConflict { .. } => false,
            Error::NotFound { .. } => true,
            Error::AlreadyExists { .. } => true,
            Error::PreconditionFailed { .. } => true,
            Error::ClusterList { .. } => true,
            Error::UnknownCluster { .. } => true,
            Error::Config { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for [`Error::NotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for [`Error::AlreadyExists`]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// True for [`Error::PreconditionFailed`]
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Error::PreconditionFailed { .. })
    }

    /// True for [`Error::OwnershipConflict`]
    pub fn is_ownership_conflict(&self) -> bool {
        matches!(self, Error::OwnershipConflict { .. })
    }

    /// Get the cluster key if this error is associated with a specific tenant cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::ClusterList { cluster, .. } => Some(cluster),
            Error::UnknownCluster { cluster } => Some(cluster),
            _ => None,
        }
    }
}
