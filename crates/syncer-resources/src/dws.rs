//! Downward sync: tenant object to super-side projection
//!
//! [`DownwardSyncer::reconcile`] handles one [`TenantRequest`]. It reads the
//! tenant object through the multi-cluster controller and the projection
//! through the super-side cache, then issues at most one mutation:
//!
//! | tenant | projection | action |
//! |--------|------------|--------|
//! | present | absent | create |
//! | present | present | update (if drifted) |
//! | absent | present | delete |
//! | absent | absent | nothing |
//!
//! Every mutation of an existing projection is guarded by its delegated UID
//! annotation, and deletes carry a UID precondition, so an object re-created
//! under the same name by someone else is never modified.

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use syncer_common::conversion::{delegated_uid, super_namespace};
use syncer_common::mc::{
    MultiClusterController, Preconditions, SuperClient, SuperLister, SyncObject, TenantRequest,
};
use syncer_common::metrics::{self, SyncOperation};
use syncer_common::{Error, Result};
use syncer_patrol::patroller::DEFAULT_LIST_TIMEOUT;

use crate::rules::SyncRules;

/// What a reconcile did to the super control plane
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Projection created
    Created,
    /// Projection updated
    Updated,
    /// Projection deleted
    Deleted,
    /// Nothing needed changing
    Unchanged,
}

/// Fail with an ownership conflict unless `projection` was delegated from the
/// tenant object with `tenant_uid`
pub fn ensure_owned<K: SyncObject>(projection: &K, tenant_uid: &str) -> Result<()> {
    let found = delegated_uid(projection).unwrap_or_default();
    if found == tenant_uid {
        return Ok(());
    }
    Err(Error::ownership_conflict(
        K::kind(&()),
        projection.namespace().unwrap_or_default(),
        projection.name_any(),
        tenant_uid,
        found,
    ))
}

/// Create `projection` in `namespace`.
///
/// The cache may lag behind the server: if the create reports the object
/// already exists, the live object is read back and the create counts as done
/// when it belongs to `tenant_uid`.
pub async fn create_projection<K: SyncObject>(
    client: &dyn SuperClient<K>,
    namespace: &str,
    projection: &K,
    tenant_uid: &str,
) -> Result<SyncOutcome> {
    let name = projection.name_any();
    match client.create(namespace, projection).await {
        Ok(()) => Ok(SyncOutcome::Created),
        Err(e) if e.is_already_exists() => match client.get(namespace, &name).await? {
            Some(live) => {
                ensure_owned(&live, tenant_uid)?;
                debug!(namespace, name = %name, "projection already exists");
                Ok(SyncOutcome::Unchanged)
            }
            // Deleted between the create and the read; let the retry create it
            None => Err(e),
        },
        Err(e) => Err(e),
    }
}

/// Delete `projection` on behalf of the tenant object with `tenant_uid`.
///
/// The delete is bound to the projection's own UID; a projection that is
/// already gone counts as deleted.
pub async fn delete_projection<K: SyncObject>(
    client: &dyn SuperClient<K>,
    projection: &K,
    tenant_uid: &str,
) -> Result<SyncOutcome> {
    ensure_owned(projection, tenant_uid)?;

    let namespace = projection.namespace().unwrap_or_default();
    let name = projection.name_any();
    let preconditions = projection
        .uid()
        .map(Preconditions::uid)
        .unwrap_or_default();

    match client.delete(&namespace, &name, &preconditions).await {
        Ok(()) => Ok(SyncOutcome::Deleted),
        Err(e) if e.is_not_found() => {
            debug!(namespace = %namespace, name = %name, "projection already deleted");
            Ok(SyncOutcome::Unchanged)
        }
        Err(e) => Err(e),
    }
}

/// Downward-sync controller for one resource kind
pub struct DownwardSyncer<K: SyncObject, R> {
    pub(crate) rules: R,
    pub(crate) mc: Arc<dyn MultiClusterController<K>>,
    pub(crate) client: Arc<dyn SuperClient<K>>,
    pub(crate) lister: Arc<dyn SuperLister<K>>,
    pub(crate) list_timeout: Duration,
}

impl<K: SyncObject, R: SyncRules<K>> DownwardSyncer<K, R> {
    /// Create a controller over the given collaborators
    pub fn new(
        rules: R,
        mc: Arc<dyn MultiClusterController<K>>,
        client: Arc<dyn SuperClient<K>>,
        lister: Arc<dyn SuperLister<K>>,
    ) -> Self {
        Self {
            rules,
            mc,
            client,
            lister,
            list_timeout: DEFAULT_LIST_TIMEOUT,
        }
    }

    /// Bound how long the patrol waits for one tenant cluster's listing
    pub fn with_list_timeout(mut self, list_timeout: Duration) -> Self {
        self.list_timeout = list_timeout;
        self
    }

    /// Kind-specific rules
    pub fn rules(&self) -> &R {
        &self.rules
    }

    /// Bring the projection of one tenant object in line with it
    #[instrument(skip(self, request), fields(kind = self.rules.kind(), request = %request))]
    pub async fn reconcile(&self, request: &TenantRequest) -> Result<SyncOutcome> {
        let target_namespace = super_namespace(&request.cluster, &request.namespace);
        let tenant = self
            .mc
            .get(&request.cluster, &request.namespace, &request.name)
            .await?;
        let live = self.lister.get(&target_namespace, &request.name)?;

        let (operation, result) = match (tenant, live) {
            (Some(tenant), None) => (
                SyncOperation::Create,
                self.create(&request.cluster, &target_namespace, &tenant)
                    .await,
            ),
            (Some(tenant), Some(live)) => (
                SyncOperation::Update,
                self.update(&target_namespace, &tenant, &live).await,
            ),
            (None, Some(live)) => (
                SyncOperation::Delete,
                delete_projection(self.client.as_ref(), &live, &request.uid).await,
            ),
            (None, None) => (SyncOperation::Noop, Ok(SyncOutcome::Unchanged)),
        };

        let operation = match result {
            Ok(SyncOutcome::Unchanged) => SyncOperation::Noop,
            _ => operation,
        };
        metrics::record_reconcile(self.rules.kind(), operation, result.is_ok());

        match &result {
            Ok(SyncOutcome::Unchanged) => debug!("projection up to date"),
            Ok(outcome) => info!(?outcome, namespace = %target_namespace, "projection synced"),
            Err(e) => warn!(error = %e, "reconcile failed"),
        }
        result
    }

    async fn create(&self, cluster: &str, target_namespace: &str, tenant: &K) -> Result<SyncOutcome> {
        let tenant_uid = tenant.uid().unwrap_or_default();
        let projection = self
            .rules
            .build_projection(cluster, target_namespace, tenant);
        create_projection(self.client.as_ref(), target_namespace, &projection, &tenant_uid).await
    }

    async fn update(&self, target_namespace: &str, tenant: &K, live: &K) -> Result<SyncOutcome> {
        ensure_owned(live, &tenant.uid().unwrap_or_default())?;
        match self.rules.desired_update(live, tenant) {
            Some(desired) => match self.client.update(target_namespace, &desired).await {
                Ok(()) => Ok(SyncOutcome::Updated),
                Err(e) if e.is_not_found() => {
                    // Deleted since the cache saw it; the next event recreates it
                    debug!(
                        namespace = %target_namespace,
                        name = %live.name_any(),
                        "projection gone before update"
                    );
                    Ok(SyncOutcome::Unchanged)
                }
                Err(e) => Err(e),
            },
            None => Ok(SyncOutcome::Unchanged),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use syncer_common::fake::{Action, FakeSuperCluster};
    use syncer_common::LABEL_UID;

    fn projection(uid: &str, delegated: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".to_string()),
                namespace: Some("ns".to_string()),
                uid: Some(uid.to_string()),
                annotations: Some(BTreeMap::from([(
                    LABEL_UID.to_string(),
                    delegated.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_ensure_owned() {
        let p = projection("super-1", "tenant-1");
        assert!(ensure_owned(&p, "tenant-1").is_ok());

        let err = ensure_owned(&p, "tenant-2").unwrap_err();
        assert!(err.is_ownership_conflict());
        assert!(err.to_string().contains("delegated UID is different"));
    }

    /// Story: a lagging cache makes us re-create an object we already own
    #[tokio::test]
    async fn story_create_is_idempotent_against_stale_cache() {
        let fake = FakeSuperCluster::with_objects([projection("super-1", "tenant-1")]);
        let outcome = create_projection(&fake, "ns", &projection("", "tenant-1"), "tenant-1")
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Unchanged);
        assert_eq!(fake.actions().len(), 1);
    }

    #[tokio::test]
    async fn test_create_conflicts_with_foreign_object() {
        let fake = FakeSuperCluster::with_objects([projection("super-1", "someone-else")]);
        let err = create_projection(&fake, "ns", &projection("", "tenant-1"), "tenant-1")
            .await
            .unwrap_err();
        assert!(err.is_ownership_conflict());
    }

    #[tokio::test]
    async fn test_delete_binds_projection_uid() {
        let fake = FakeSuperCluster::with_objects([projection("super-1", "tenant-1")]);
        let outcome = delete_projection(&fake, &projection("super-1", "tenant-1"), "tenant-1")
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Deleted);
        assert_eq!(
            fake.actions(),
            vec![Action::Delete {
                namespace: "ns".to_string(),
                name: "cm".to_string(),
                preconditions: Preconditions::uid("super-1"),
            }]
        );
    }

    #[tokio::test]
    async fn test_delete_of_missing_projection_is_converged() {
        let fake = FakeSuperCluster::<ConfigMap>::new();
        let outcome = delete_projection(&fake, &projection("super-1", "tenant-1"), "tenant-1")
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_delete_refuses_foreign_projection() {
        let fake = FakeSuperCluster::with_objects([projection("super-1", "someone-else")]);
        let err = delete_projection(&fake, &projection("super-1", "someone-else"), "tenant-1")
            .await
            .unwrap_err();
        assert!(err.is_ownership_conflict());
        assert!(fake.actions().is_empty());
    }
}
