//! Keyed set difference between tenant-side and super-side objects
//!
//! Both sides are indexed by [`ClusterObjectKey`]. A tenant object is keyed by
//! the cluster it was listed from, its namespace and name; a projection is
//! keyed by the cluster and namespace recorded in its annotations and its
//! name. A projection and its tenant source therefore share a key even though
//! they live in different namespaces of different control planes.

use std::collections::hash_map::{self, HashMap};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use syncer_common::conversion;
use syncer_common::mc::SyncObject;

/// Identity of an object across all tenant clusters
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterObjectKey {
    /// Cluster key of the owning tenant
    pub cluster: String,
    /// Tenant-side namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ClusterObjectKey {
    /// Create a key from its parts
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.namespace, self.name)
    }
}

/// One object taking part in a diff, tagged with the cluster that owns it
#[derive(Debug)]
pub struct ClusterObject<K> {
    object: Arc<K>,
    key: ClusterObjectKey,
    owner: Option<String>,
}

impl<K> Clone for ClusterObject<K> {
    fn clone(&self) -> Self {
        Self {
            object: Arc::clone(&self.object),
            key: self.key.clone(),
            owner: self.owner.clone(),
        }
    }
}

impl<K: SyncObject> ClusterObject<K> {
    /// Wrap an object listed from tenant `cluster`
    pub fn tenant(cluster: &str, object: K) -> Self {
        let key = ClusterObjectKey::new(
            cluster,
            object.namespace().unwrap_or_default(),
            object.name_any(),
        );
        Self {
            object: Arc::new(object),
            key,
            owner: Some(cluster.to_string()),
        }
    }

    /// Wrap a projection listed from the super control plane.
    ///
    /// The key comes from the cluster and namespace annotations; an object
    /// missing them gets empty components and matches no tenant object.
    pub fn super_side(object: K) -> Self {
        let key = ClusterObjectKey::new(
            conversion::owner_cluster(&object).unwrap_or_default(),
            conversion::tenant_namespace(&object).unwrap_or_default(),
            object.name_any(),
        );
        Self {
            object: Arc::new(object),
            key,
            owner: None,
        }
    }

    /// Identity used for the diff
    pub fn key(&self) -> &ClusterObjectKey {
        &self.key
    }

    /// The wrapped object
    pub fn object(&self) -> &K {
        &self.object
    }

    /// Cluster owning this object: the listing cluster for tenant objects,
    /// the cluster annotation for projections
    pub fn owner_cluster(&self) -> Option<&str> {
        self.owner
            .as_deref()
            .or_else(|| conversion::owner_cluster(self.object.as_ref()))
    }

    /// UID of the wrapped object itself
    pub fn uid(&self) -> Option<&str> {
        self.object.meta().uid.as_deref()
    }

    /// Tenant UID recorded on a projection
    pub fn delegated_uid(&self) -> Option<&str> {
        conversion::delegated_uid(self.object.as_ref())
    }

    /// True if this object was listed from a tenant cluster
    pub fn is_tenant(&self) -> bool {
        self.owner.is_some()
    }
}

/// Callbacks receiving the differences between two [`DiffSet`]s.
///
/// Implementations record their own outcomes; a failure to handle one
/// difference must not stop the others.
#[async_trait]
pub trait DifferenceHandler<K: SyncObject>: Send + Sync {
    /// `obj` exists only in the receiving set
    async fn on_add(&self, obj: &ClusterObject<K>);

    /// Both sets hold the key; `obj` from the receiving set, `other` from the other
    async fn on_update(&self, obj: &ClusterObject<K>, other: &ClusterObject<K>);

    /// `other` exists only in the other set
    async fn on_delete(&self, other: &ClusterObject<K>);
}

#[async_trait]
impl<K, H> DifferenceHandler<K> for &H
where
    K: SyncObject,
    H: DifferenceHandler<K> + ?Sized,
{
    async fn on_add(&self, obj: &ClusterObject<K>) {
        (**self).on_add(obj).await
    }

    async fn on_update(&self, obj: &ClusterObject<K>, other: &ClusterObject<K>) {
        (**self).on_update(obj, other).await
    }

    async fn on_delete(&self, other: &ClusterObject<K>) {
        (**self).on_delete(other).await
    }
}

/// Predicate deciding whether an object may take part in remediation
pub trait ObjectFilter<K>: Send + Sync {
    /// True if callbacks for `obj` may be dispatched
    fn accept(&self, obj: &ClusterObject<K>) -> bool;
}

impl<K, F> ObjectFilter<K> for F
where
    F: Fn(&ClusterObject<K>) -> bool + Send + Sync,
{
    fn accept(&self, obj: &ClusterObject<K>) -> bool {
        self(obj)
    }
}

/// Accepts objects whose owner cluster was listed successfully this pass
#[derive(Clone, Debug, Default)]
pub struct KnownClusterFilter {
    known: BTreeSet<String>,
}

impl KnownClusterFilter {
    /// Filter over the given cluster keys
    pub fn new(known: BTreeSet<String>) -> Self {
        Self { known }
    }

    /// Cluster keys accepted by this filter
    pub fn known(&self) -> &BTreeSet<String> {
        &self.known
    }
}

impl<K: SyncObject> ObjectFilter<K> for KnownClusterFilter {
    fn accept(&self, obj: &ClusterObject<K>) -> bool {
        obj.owner_cluster()
            .is_some_and(|cluster| self.known.contains(cluster))
    }
}

/// [`DifferenceHandler`] that drops callbacks for objects rejected by a filter.
///
/// An update whose sides disagree degrades: if only `obj` passes it becomes an
/// add, if only `other` passes it becomes a delete.
pub struct FilteringHandler<H, F> {
    handler: H,
    filter: F,
}

impl<H, F> FilteringHandler<H, F> {
    /// Wrap `handler` behind `filter`
    pub fn new(handler: H, filter: F) -> Self {
        Self { handler, filter }
    }

    /// The wrapped handler
    pub fn inner(&self) -> &H {
        &self.handler
    }

    /// Unwrap the handler
    pub fn into_inner(self) -> H {
        self.handler
    }
}

#[async_trait]
impl<K, H, F> DifferenceHandler<K> for FilteringHandler<H, F>
where
    K: SyncObject,
    H: DifferenceHandler<K>,
    F: ObjectFilter<K>,
{
    async fn on_add(&self, obj: &ClusterObject<K>) {
        if self.filter.accept(obj) {
            self.handler.on_add(obj).await;
        }
    }

    async fn on_update(&self, obj: &ClusterObject<K>, other: &ClusterObject<K>) {
        match (self.filter.accept(obj), self.filter.accept(other)) {
            (true, true) => self.handler.on_update(obj, other).await,
            (true, false) => self.handler.on_add(obj).await,
            (false, true) => self.handler.on_delete(other).await,
            (false, false) => {}
        }
    }

    async fn on_delete(&self, other: &ClusterObject<K>) {
        if self.filter.accept(other) {
            self.handler.on_delete(other).await;
        }
    }
}

/// Objects of one side of a diff, indexed by [`ClusterObjectKey`]
#[derive(Debug)]
pub struct DiffSet<K> {
    objects: HashMap<ClusterObjectKey, ClusterObject<K>>,
}

impl<K> Default for DiffSet<K> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
        }
    }
}

impl<K: SyncObject> DiffSet<K> {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `obj` under its key, replacing any previous object with that key
    pub fn insert(&mut self, obj: ClusterObject<K>) {
        self.objects.insert(obj.key().clone(), obj);
    }

    /// Object stored under `key`
    pub fn get(&self, key: &ClusterObjectKey) -> Option<&ClusterObject<K>> {
        self.objects.get(key)
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True if the set holds nothing
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Iterate over stored objects in no particular order
    pub fn iter(&self) -> hash_map::Values<'_, ClusterObjectKey, ClusterObject<K>> {
        self.objects.values()
    }

    /// Dispatch every difference between `self` and `other` to `handler`.
    ///
    /// Keys only in `self` get `on_add`, keys in both get `on_update` and keys
    /// only in `other` get `on_delete`. Every key receives exactly one
    /// callback; the order is unspecified.
    pub async fn difference<H>(&self, other: &DiffSet<K>, handler: &H)
    where
        H: DifferenceHandler<K> + ?Sized,
    {
        for (key, obj) in &self.objects {
            match other.objects.get(key) {
                Some(other_obj) => handler.on_update(obj, other_obj).await,
                None => handler.on_add(obj).await,
            }
        }
        for (key, other_obj) in &other.objects {
            if !self.objects.contains_key(key) {
                handler.on_delete(other_obj).await;
            }
        }
    }
}

impl<K: SyncObject> FromIterator<ClusterObject<K>> for DiffSet<K> {
    fn from_iter<I: IntoIterator<Item = ClusterObject<K>>>(iter: I) -> Self {
        let mut set = Self::new();
        for obj in iter {
            set.insert(obj);
        }
        set
    }
}

impl<K: SyncObject> Extend<ClusterObject<K>> for DiffSet<K> {
    fn extend<I: IntoIterator<Item = ClusterObject<K>>>(&mut self, iter: I) {
        for obj in iter {
            self.insert(obj);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use parking_lot::Mutex;
    use syncer_common::{LABEL_CLUSTER, LABEL_NAMESPACE, LABEL_UID};

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn events(&self) -> Vec<String> {
            let mut events = self.events.lock().clone();
            events.sort();
            events
        }
    }

    #[async_trait]
    impl DifferenceHandler<Service> for RecordingHandler {
        async fn on_add(&self, obj: &ClusterObject<Service>) {
            self.events.lock().push(format!("add {}", obj.key()));
        }

        async fn on_update(&self, obj: &ClusterObject<Service>, other: &ClusterObject<Service>) {
            assert_eq!(obj.key(), other.key());
            self.events.lock().push(format!("update {}", obj.key()));
        }

        async fn on_delete(&self, other: &ClusterObject<Service>) {
            self.events.lock().push(format!("delete {}", other.key()));
        }
    }

    fn tenant_svc(cluster: &str, namespace: &str, name: &str) -> ClusterObject<Service> {
        ClusterObject::tenant(
            cluster,
            Service {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    uid: Some(format!("{name}-tenant")),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    fn super_svc(cluster: &str, namespace: &str, name: &str) -> ClusterObject<Service> {
        ClusterObject::super_side(Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(format!("{cluster}-{namespace}")),
                uid: Some(format!("{name}-super")),
                annotations: Some(BTreeMap::from([
                    (LABEL_CLUSTER.to_string(), cluster.to_string()),
                    (LABEL_NAMESPACE.to_string(), namespace.to_string()),
                    (LABEL_UID.to_string(), format!("{name}-tenant")),
                ])),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn test_projection_shares_key_with_tenant_source() {
        let tenant = tenant_svc("c1", "default", "svc-1");
        let projection = super_svc("c1", "default", "svc-1");
        assert_eq!(tenant.key(), projection.key());
        assert_eq!(projection.owner_cluster(), Some("c1"));
        assert_eq!(projection.delegated_uid(), tenant.uid());
        assert!(tenant.is_tenant());
        assert!(!projection.is_tenant());
    }

    #[test]
    fn test_insert_overwrites_same_key() {
        let mut set = DiffSet::new();
        set.insert(tenant_svc("c1", "default", "svc-1"));
        set.insert(tenant_svc("c1", "default", "svc-1"));
        set.insert(tenant_svc("c2", "default", "svc-1"));
        assert_eq!(set.len(), 2);
    }

    /// Story: every key on either side gets exactly one callback
    #[tokio::test]
    async fn story_difference_is_complete() {
        let tenant: DiffSet<Service> = [
            tenant_svc("c1", "default", "only-tenant"),
            tenant_svc("c1", "default", "both"),
        ]
        .into_iter()
        .collect();
        let projections: DiffSet<Service> = [
            super_svc("c1", "default", "both"),
            super_svc("c1", "default", "only-super"),
        ]
        .into_iter()
        .collect();

        let handler = RecordingHandler::default();
        tenant.difference(&projections, &handler).await;

        assert_eq!(
            handler.events(),
            vec![
                "add c1/default/only-tenant",
                "delete c1/default/only-super",
                "update c1/default/both",
            ]
        );
    }

    #[tokio::test]
    async fn test_difference_of_empty_sets_is_silent() {
        let handler = RecordingHandler::default();
        DiffSet::<Service>::new()
            .difference(&DiffSet::new(), &handler)
            .await;
        assert!(handler.events().is_empty());
    }

    /// Story: a projection owned by a cluster that could not be listed is not an orphan
    #[tokio::test]
    async fn story_unknown_cluster_suppresses_callbacks() {
        let tenant: DiffSet<Service> = [tenant_svc("c1", "default", "a")].into_iter().collect();
        let projections: DiffSet<Service> = [
            super_svc("c2", "default", "orphan-of-unlisted"),
            super_svc("c1", "default", "orphan"),
        ]
        .into_iter()
        .collect();

        let filter = KnownClusterFilter::new(BTreeSet::from(["c1".to_string()]));
        let handler = FilteringHandler::new(RecordingHandler::default(), filter);
        tenant.difference(&projections, &handler).await;

        assert_eq!(
            handler.inner().events(),
            vec!["add c1/default/a", "delete c1/default/orphan"]
        );
    }

    #[tokio::test]
    async fn test_update_degrades_when_one_side_is_rejected() {
        let tenant = tenant_svc("c1", "default", "svc");
        let projection = super_svc("c1", "default", "svc");

        let only_tenant = FilteringHandler::new(
            RecordingHandler::default(),
            |obj: &ClusterObject<Service>| obj.is_tenant(),
        );
        only_tenant.on_update(&tenant, &projection).await;
        assert_eq!(only_tenant.inner().events(), vec!["add c1/default/svc"]);

        let only_super = FilteringHandler::new(
            RecordingHandler::default(),
            |obj: &ClusterObject<Service>| !obj.is_tenant(),
        );
        only_super.on_update(&tenant, &projection).await;
        assert_eq!(only_super.inner().events(), vec!["delete c1/default/svc"]);

        let neither = FilteringHandler::new(
            RecordingHandler::default(),
            |_: &ClusterObject<Service>| false,
        );
        neither.on_update(&tenant, &projection).await;
        neither.on_add(&tenant).await;
        neither.on_delete(&projection).await;
        assert!(neither.into_inner().events().is_empty());
    }

    #[test]
    fn test_projection_without_annotations_is_never_known() {
        let bare = ClusterObject::super_side(Service {
            metadata: ObjectMeta {
                name: Some("bare".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let filter = KnownClusterFilter::new(BTreeSet::from(["c1".to_string()]));
        assert_eq!(bare.owner_cluster(), None);
        assert!(!ObjectFilter::<Service>::accept(&filter, &bare));
    }
}
