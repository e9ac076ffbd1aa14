//! In-memory fakes of the tenant and super control planes
//!
//! [`FakeSuperCluster`] implements both [`SuperClient`] and [`SuperLister`]
//! over one shared store, so a create is visible to the next lister read the
//! way a synced watch cache would be. Every mutation call is recorded as an
//! [`Action`], including calls the fake rejects.
//!
//! [`FakeTenantClusters`] implements [`MultiClusterController`] with
//! per-cluster object maps, injectable listing failures and a record of
//! requeued requests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use kube::ResourceExt;
use parking_lot::Mutex;

use crate::mc::{
    LabelSelector, MultiClusterController, Preconditions, SuperClient, SuperLister, SyncObject,
    TenantRequest,
};
use crate::{Error, Result};

type ObjectKey = (String, String);

fn object_key<K: SyncObject>(namespace: &str, obj: &K) -> ObjectKey {
    (namespace.to_string(), obj.name_any())
}

fn kind_of<K: SyncObject>() -> String {
    K::kind(&()).to_string()
}

/// One mutation call received by [`FakeSuperCluster`]
#[derive(Clone, Debug, PartialEq)]
pub enum Action<K> {
    /// `create` call
    Create {
        /// Target namespace
        namespace: String,
        /// Object as sent
        object: K,
    },
    /// `update` call
    Update {
        /// Target namespace
        namespace: String,
        /// Object as sent
        object: K,
    },
    /// `delete` call
    Delete {
        /// Target namespace
        namespace: String,
        /// Target name
        name: String,
        /// Preconditions sent with the call
        preconditions: Preconditions,
    },
}

impl<K: SyncObject> Action<K> {
    /// "create", "update" or "delete"
    pub fn verb(&self) -> &'static str {
        match self {
            Action::Create { .. } => "create",
            Action::Update { .. } => "update",
            Action::Delete { .. } => "delete",
        }
    }

    /// `namespace/name` of the target object
    pub fn full_name(&self) -> String {
        match self {
            Action::Create { namespace, object } | Action::Update { namespace, object } => {
                format!("{}/{}", namespace, object.name_any())
            }
            Action::Delete {
                namespace, name, ..
            } => format!("{namespace}/{name}"),
        }
    }

    /// Object sent with a create or update
    pub fn object(&self) -> Option<&K> {
        match self {
            Action::Create { object, .. } | Action::Update { object, .. } => Some(object),
            Action::Delete { .. } => None,
        }
    }
}

/// Stateful fake of the super control plane
pub struct FakeSuperCluster<K> {
    objects: Mutex<BTreeMap<ObjectKey, K>>,
    actions: Mutex<Vec<Action<K>>>,
    synced: AtomicBool,
    next_uid: AtomicU64,
    list_error: Mutex<Option<String>>,
}

impl<K: SyncObject> Default for FakeSuperCluster<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: SyncObject> FakeSuperCluster<K> {
    /// Empty, synced super cluster
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            actions: Mutex::new(Vec::new()),
            synced: AtomicBool::new(true),
            next_uid: AtomicU64::new(1),
            list_error: Mutex::new(None),
        }
    }

    /// Super cluster pre-populated with `objects` (not recorded as actions)
    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let fake = Self::new();
        for obj in objects {
            fake.seed(obj);
        }
        fake
    }

    /// Store an object directly, bypassing action recording
    pub fn seed(&self, obj: K) {
        let namespace = obj.namespace().unwrap_or_default();
        self.objects.lock().insert(object_key(&namespace, &obj), obj);
    }

    /// Remove an object directly, bypassing action recording
    pub fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// Current object at `namespace/name`
    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Number of stored objects
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Every mutation call received so far
    pub fn actions(&self) -> Vec<Action<K>> {
        self.actions.lock().clone()
    }

    /// Forget recorded actions
    pub fn clear_actions(&self) {
        self.actions.lock().clear();
    }

    /// Set the value reported by `has_synced`
    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    /// Make lister `list` calls fail with `message` (or succeed again with `None`)
    pub fn fail_list(&self, message: Option<&str>) {
        *self.list_error.lock() = message.map(str::to_string);
    }

    fn record(&self, action: Action<K>) {
        self.actions.lock().push(action);
    }
}

#[async_trait]
impl<K: SyncObject> SuperClient<K> for FakeSuperCluster<K> {
    async fn create(&self, namespace: &str, obj: &K) -> Result<()> {
        self.record(Action::Create {
            namespace: namespace.to_string(),
            object: obj.clone(),
        });
        let key = object_key(namespace, obj);
        let mut objects = self.objects.lock();
        if objects.contains_key(&key) {
            return Err(Error::already_exists(kind_of::<K>(), namespace, key.1));
        }
        let mut stored = obj.clone();
        stored.meta_mut().namespace = Some(namespace.to_string());
        if stored.meta().uid.is_none() {
            let uid = self.next_uid.fetch_add(1, Ordering::SeqCst);
            stored.meta_mut().uid = Some(format!("super-uid-{uid}"));
        }
        objects.insert(key, stored);
        Ok(())
    }

    async fn update(&self, namespace: &str, obj: &K) -> Result<()> {
        self.record(Action::Update {
            namespace: namespace.to_string(),
            object: obj.clone(),
        });
        let key = object_key(namespace, obj);
        let mut objects = self.objects.lock();
        match objects.get_mut(&key) {
            Some(existing) => {
                *existing = obj.clone();
                Ok(())
            }
            None => Err(Error::not_found(kind_of::<K>(), namespace, key.1)),
        }
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        preconditions: &Preconditions,
    ) -> Result<()> {
        self.record(Action::Delete {
            namespace: namespace.to_string(),
            name: name.to_string(),
            preconditions: preconditions.clone(),
        });
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.objects.lock();
        let Some(existing) = objects.get(&key) else {
            return Err(Error::not_found(kind_of::<K>(), namespace, name));
        };
        if let Some(uid) = &preconditions.uid {
            let actual = existing.meta().uid.clone().unwrap_or_default();
            if &actual != uid {
                return Err(Error::precondition_failed(
                    kind_of::<K>(),
                    namespace,
                    name,
                    format!("UID in precondition: {uid}, UID in object meta: {actual}"),
                ));
            }
        }
        objects.remove(&key);
        Ok(())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.object(namespace, name))
    }
}

impl<K: SyncObject> SuperLister<K> for FakeSuperCluster<K> {
    fn list(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        if let Some(message) = self.list_error.lock().clone() {
            return Err(Error::internal_with_context("lister", message));
        }
        Ok(self
            .objects
            .lock()
            .values()
            .filter(|obj| selector.matches(obj.labels()))
            .cloned()
            .collect())
    }

    fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.object(namespace, name))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Stateful fake of a set of tenant clusters
pub struct FakeTenantClusters<K> {
    clusters: Mutex<BTreeMap<String, BTreeMap<ObjectKey, K>>>,
    failing: Mutex<BTreeSet<String>>,
    requeued: Mutex<Vec<TenantRequest>>,
    requeue_fails: AtomicBool,
}

impl<K: SyncObject> Default for FakeTenantClusters<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: SyncObject> FakeTenantClusters<K> {
    /// No tenant clusters
    pub fn new() -> Self {
        Self {
            clusters: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(BTreeSet::new()),
            requeued: Mutex::new(Vec::new()),
            requeue_fails: AtomicBool::new(false),
        }
    }

    /// Register an empty tenant cluster
    pub fn add_cluster(&self, cluster: &str) {
        self.clusters.lock().entry(cluster.to_string()).or_default();
    }

    /// Unregister a tenant cluster and its objects
    pub fn remove_cluster(&self, cluster: &str) {
        self.clusters.lock().remove(cluster);
    }

    /// Store a tenant object, registering the cluster if needed
    pub fn insert(&self, cluster: &str, obj: K) {
        let namespace = obj.namespace().unwrap_or_default();
        self.clusters
            .lock()
            .entry(cluster.to_string())
            .or_default()
            .insert(object_key(&namespace, &obj), obj);
    }

    /// Remove a tenant object
    pub fn delete(&self, cluster: &str, namespace: &str, name: &str) -> Option<K> {
        self.clusters
            .lock()
            .get_mut(cluster)
            .and_then(|objs| objs.remove(&(namespace.to_string(), name.to_string())))
    }

    /// Make listing `cluster` fail (or succeed again)
    pub fn set_list_failure(&self, cluster: &str, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(cluster.to_string());
        } else {
            set.remove(cluster);
        }
    }

    /// Make every `requeue_object` call fail
    pub fn set_requeue_failure(&self, failing: bool) {
        self.requeue_fails.store(failing, Ordering::SeqCst);
    }

    /// Requests passed to `requeue_object` so far
    pub fn requeued(&self) -> Vec<TenantRequest> {
        self.requeued.lock().clone()
    }
}

#[async_trait]
impl<K: SyncObject> MultiClusterController<K> for FakeTenantClusters<K> {
    fn cluster_names(&self) -> Vec<String> {
        self.clusters.lock().keys().cloned().collect()
    }

    async fn list(&self, cluster: &str) -> Result<Vec<K>> {
        if self.failing.lock().contains(cluster) {
            return Err(Error::cluster_list(
                cluster,
                kind_of::<K>(),
                "connection refused",
            ));
        }
        let clusters = self.clusters.lock();
        let objects = clusters.get(cluster).ok_or_else(|| Error::UnknownCluster {
            cluster: cluster.to_string(),
        })?;
        Ok(objects.values().cloned().collect())
    }

    async fn get(&self, cluster: &str, namespace: &str, name: &str) -> Result<Option<K>> {
        let clusters = self.clusters.lock();
        let objects = clusters.get(cluster).ok_or_else(|| Error::UnknownCluster {
            cluster: cluster.to_string(),
        })?;
        Ok(objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn requeue_object(&self, cluster: &str, obj: &K) -> Result<()> {
        if self.requeue_fails.load(Ordering::SeqCst) {
            return Err(Error::internal_with_context("queue", "queue is shut down"));
        }
        self.requeued
            .lock()
            .push(TenantRequest::for_object(cluster, obj));
        Ok(())
    }
}
