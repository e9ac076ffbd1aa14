//! Kubernetes-backed implementations of the collaborator traits

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, ListParams, PostParams, Preconditions as KubePreconditions};
use kube::core::NamespaceResourceScope;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tokio::sync::mpsc;

use super::{
    LabelSelector, MultiClusterController, Preconditions, SuperClient, SuperLister, SyncObject,
};
use crate::kube_utils::watcher_config;
use crate::{Error, Result};

/// Requeues buffered per tenant cluster before `requeue_object` waits
pub const REQUEUE_BUFFER: usize = 1024;

fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).to_string()
}

// =============================================================================
// Super-side client
// =============================================================================

/// [`SuperClient`] issuing requests against the super control plane API server
pub struct KubeSuperClient<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeSuperClient<K> {
    /// Wrap a kube client for one resource kind
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K> SuperClient<K> for KubeSuperClient<K>
where
    K: SyncObject + Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned,
{
    async fn create(&self, namespace: &str, obj: &K) -> Result<()> {
        let name = obj.name_any();
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &kind_of::<K>(), namespace, &name))?;
        Ok(())
    }

    async fn update(&self, namespace: &str, obj: &K) -> Result<()> {
        let name = obj.name_any();
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &kind_of::<K>(), namespace, &name))?;
        Ok(())
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        preconditions: &Preconditions,
    ) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            preconditions: Some(KubePreconditions {
                uid: preconditions.uid.clone(),
                resource_version: preconditions.resource_version.clone(),
            }),
            ..DeleteParams::default()
        };
        api.delete(name, &params)
            .await
            .map_err(|e| Error::from_kube(e, &kind_of::<K>(), namespace, name))?;
        Ok(())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, &kind_of::<K>(), namespace, name))
    }
}

// =============================================================================
// Super-side lister
// =============================================================================

/// [`SuperLister`] over a reflector store watching the syncer's projections
pub struct ReflectorSuperLister<K: SyncObject> {
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K> ReflectorSuperLister<K>
where
    K: SyncObject + DeserializeOwned,
{
    /// Start watching projected objects of this kind across all namespaces.
    ///
    /// The watch runs until `cancel` fires. [`SuperLister::has_synced`] turns
    /// true once the initial listing has been stored.
    pub fn spawn(client: Client, cancel: CancellationToken) -> Self {
        let api: Api<K> = Api::all(client);
        let (store, writer) = reflector::store();
        let stream = reflector::reflector(writer, watcher::watcher(api, projection_watch_config()))
            .default_backoff()
            .touched_objects();

        let kind = kind_of::<K>();
        tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(_)) => {}
                        Some(Err(e)) => warn!(kind = %kind, error = %e, "super-side watch error"),
                        None => break,
                    },
                }
            }
            debug!(kind = %kind, "super-side watch stopped");
        });

        let synced = Arc::new(AtomicBool::new(false));
        {
            let store = store.clone();
            let synced = synced.clone();
            let kind = kind_of::<K>();
            tokio::spawn(async move {
                if store.wait_until_ready().await.is_ok() {
                    synced.store(true, Ordering::Release);
                    info!(kind = %kind, "super-side cache synced");
                }
            });
        }

        Self { store, synced }
    }
}

/// Watch of the syncer's own projections
fn projection_watch_config() -> watcher::Config {
    watcher_config().labels(&LabelSelector::super_cluster_objects().to_string())
}

impl<K: SyncObject> SuperLister<K> for ReflectorSuperLister<K> {
    fn list(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        Ok(self
            .store
            .state()
            .iter()
            .filter(|obj| selector.matches(obj.labels()))
            .map(|obj| obj.as_ref().clone())
            .collect())
    }

    fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self
            .store
            .get(&ObjectRef::new(name).within(namespace))
            .map(|obj| obj.as_ref().clone()))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

// =============================================================================
// Multi-cluster controller
// =============================================================================

/// Receiving ends of the requeue channels, keyed by cluster key
pub type RequeueReceivers<K> = BTreeMap<String, mpsc::Receiver<ObjectRef<K>>>;

/// [`MultiClusterController`] over a fixed set of tenant API servers.
///
/// Lists and reads go straight to each tenant's API server. A requeued object
/// is sent as an [`ObjectRef`] to the controller watching its tenant cluster.
pub struct KubeMultiClusterController<K: SyncObject> {
    clients: Arc<BTreeMap<String, Client>>,
    requeues: BTreeMap<String, mpsc::Sender<ObjectRef<K>>>,
}

impl<K: SyncObject> KubeMultiClusterController<K> {
    /// Create a controller over tenant clients keyed by cluster key.
    ///
    /// Returns one requeue receiver per tenant cluster; each must be handed to
    /// that cluster's controller or requeues for it fail once the buffer fills.
    pub fn new(clients: Arc<BTreeMap<String, Client>>) -> (Self, RequeueReceivers<K>) {
        let mut requeues = BTreeMap::new();
        let mut receivers = BTreeMap::new();
        for cluster in clients.keys() {
            let (tx, rx) = mpsc::channel(REQUEUE_BUFFER);
            requeues.insert(cluster.clone(), tx);
            receivers.insert(cluster.clone(), rx);
        }
        (Self { clients, requeues }, receivers)
    }

    fn client(&self, cluster: &str) -> Result<Client> {
        self.clients
            .get(cluster)
            .cloned()
            .ok_or_else(|| Error::UnknownCluster {
                cluster: cluster.to_string(),
            })
    }
}

#[async_trait]
impl<K> MultiClusterController<K> for KubeMultiClusterController<K>
where
    K: SyncObject + Resource<Scope = NamespaceResourceScope> + DeserializeOwned,
{
    fn cluster_names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    async fn list(&self, cluster: &str) -> Result<Vec<K>> {
        let api: Api<K> = Api::all(self.client(cluster)?);
        api.list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| Error::cluster_list(cluster, kind_of::<K>(), e.to_string()))
    }

    async fn get(&self, cluster: &str, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client(cluster)?, namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, &kind_of::<K>(), namespace, name))
    }

    async fn requeue_object(&self, cluster: &str, obj: &K) -> Result<()> {
        let sender = self.requeues.get(cluster).ok_or_else(|| Error::UnknownCluster {
            cluster: cluster.to_string(),
        })?;
        sender.send(ObjectRef::from_obj(obj)).await.map_err(|_| {
            Error::internal_with_context(
                "requeue_object",
                format!("controller of cluster {cluster} is not running"),
            )
        })
    }
}
