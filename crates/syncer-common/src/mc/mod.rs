//! Boundaries of the multi-cluster controller and the super control plane
//!
//! The reconciliation engine only talks to its collaborators through the
//! traits in this module:
//!
//! - [`MultiClusterController`]: tenant cluster enumeration, per-cluster
//!   listing and reads, and requeue of work items onto the event path
//! - [`SuperClient`]: create/update/delete against the super control plane
//! - [`SuperLister`]: read-only view of the super-side watch cache
//!
//! Kubernetes-backed implementations live in [`kube_impl`].

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};

use crate::{Result, CONTROLLED_BY_SYNCER, LABEL_CONTROLLED_BY};

pub mod kube_impl;

/// Bound shared by every payload type the engine can sync
pub trait SyncObject:
    Resource<DynamicType = ()> + Clone + fmt::Debug + Send + Sync + 'static
{
}

impl<T> SyncObject for T where
    T: Resource<DynamicType = ()> + Clone + fmt::Debug + Send + Sync + 'static
{
}

/// A unit of work on the event path: one tenant object in one tenant cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantRequest {
    /// Cluster key of the owning tenant
    pub cluster: String,
    /// Tenant-side namespace
    pub namespace: String,
    /// Object name
    pub name: String,
    /// UID of the tenant object the event was observed for
    pub uid: String,
}

impl TenantRequest {
    /// Create a request from its parts
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }

    /// Build the request that reconciles `obj` of tenant `cluster`
    pub fn for_object<K: Resource>(cluster: &str, obj: &K) -> Self {
        Self::new(
            cluster,
            obj.namespace().unwrap_or_default(),
            obj.name_any(),
            obj.uid().unwrap_or_default(),
        )
    }
}

impl fmt::Display for TenantRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.namespace, self.name)
    }
}

/// Conditions the super control plane checks before applying a mutation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Preconditions {
    /// Object must still have this UID
    pub uid: Option<String>,
    /// Object must still be at this resourceVersion
    pub resource_version: Option<String>,
}

impl Preconditions {
    /// No preconditions
    pub fn none() -> Self {
        Self::default()
    }

    /// Require the object to still carry `uid`
    pub fn uid(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            resource_version: None,
        }
    }
}

/// Equality-based label selector evaluated against a local cache
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Selector matching every object
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector requiring `key=value`
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::everything().and(key, value)
    }

    /// Add another `key=value` requirement
    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Selector for objects this syncer projected into the super cluster
    pub fn super_cluster_objects() -> Self {
        Self::equals(LABEL_CONTROLLED_BY, CONTROLLED_BY_SYNCER)
    }

    /// True if `labels` satisfies every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// Tenant-facing side of the multi-cluster controller
#[async_trait]
pub trait MultiClusterController<K: SyncObject>: Send + Sync {
    /// Cluster keys of all tenant clusters currently registered
    fn cluster_names(&self) -> Vec<String>;

    /// List every object of this kind in one tenant cluster
    async fn list(&self, cluster: &str) -> Result<Vec<K>>;

    /// Read one tenant object; `Ok(None)` if it does not exist
    async fn get(&self, cluster: &str, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Put a tenant object back on the event path
    async fn requeue_object(&self, cluster: &str, obj: &K) -> Result<()>;
}

/// Mutations against the super control plane
#[async_trait]
pub trait SuperClient<K: SyncObject>: Send + Sync {
    /// Create `obj` in `namespace`
    async fn create(&self, namespace: &str, obj: &K) -> Result<()>;

    /// Replace `obj` in `namespace`; carries the object's resourceVersion
    async fn update(&self, namespace: &str, obj: &K) -> Result<()>;

    /// Delete `name` from `namespace` if `preconditions` hold
    async fn delete(&self, namespace: &str, name: &str, preconditions: &Preconditions)
        -> Result<()>;

    /// Read the live object straight from the API server, bypassing any cache
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;
}

/// Read-only view of the super-side watch cache
pub trait SuperLister<K: SyncObject>: Send + Sync {
    /// Objects in the cache matching `selector`
    fn list(&self, selector: &LabelSelector) -> Result<Vec<K>>;

    /// One object from the cache; `Ok(None)` if it is not cached
    fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// True once the cache has completed its initial listing
    fn has_synced(&self) -> bool;
}
