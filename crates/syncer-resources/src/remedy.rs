//! Patrol remediation shared by every synced kind
//!
//! The patrol compares tenant objects (receiving set) against projections
//! (other set):
//! - tenant object without projection: requeue the tenant object
//! - both present but the projection belongs to another tenant object:
//!   delete the projection
//! - both present and owned: requeue if the kind's rules report drift
//! - projection without tenant object: delete the orphan
//!
//! Deletes are bound to the projection's own UID; a delete the server rejects
//! because the object changed or vanished is counted as an abstention.

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, instrument, warn};

use syncer_common::mc::{MultiClusterController, Preconditions, SuperClient, SyncObject};
use syncer_common::metrics::RemedyAction;
use syncer_patrol::differ::{ClusterObject, DifferenceHandler};
use syncer_patrol::patroller::{take_snapshot, PatrolDo, PatrolStats, PatrolSummary};

use crate::dws::DownwardSyncer;
use crate::rules::SyncRules;

/// Put a tenant object back on the event path
pub async fn requeue_tenant<K: SyncObject>(
    kind: &str,
    mc: &dyn MultiClusterController<K>,
    stats: &PatrolStats,
    tenant: &ClusterObject<K>,
) {
    let Some(cluster) = tenant.owner_cluster() else {
        warn!(kind, key = %tenant.key(), "tenant object without owner cluster");
        stats.record(kind, RemedyAction::Failed);
        return;
    };
    match mc.requeue_object(cluster, tenant.object()).await {
        Ok(()) => stats.record(kind, RemedyAction::Requeue),
        Err(e) => {
            warn!(kind, key = %tenant.key(), error = %e, "failed to requeue tenant object");
            stats.record(kind, RemedyAction::Failed);
        }
    }
}

/// Delete a projection with no live tenant object behind it
pub async fn delete_orphan<K: SyncObject>(
    kind: &str,
    client: &dyn SuperClient<K>,
    stats: &PatrolStats,
    projection: &ClusterObject<K>,
) {
    let obj = projection.object();
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();

    // Never delete without binding the delete to the object we looked at
    let Some(uid) = projection.uid() else {
        warn!(kind, namespace = %namespace, name = %name, "projection without UID, not deleting");
        stats.record(kind, RemedyAction::Abstain);
        return;
    };

    match client
        .delete(&namespace, &name, &Preconditions::uid(uid))
        .await
    {
        Ok(()) => {
            debug!(kind, namespace = %namespace, name = %name, "deleted orphan projection");
            stats.record(kind, RemedyAction::DeleteOrphan);
        }
        Err(e) if e.is_not_found() || e.is_precondition_failed() => {
            debug!(kind, namespace = %namespace, name = %name, error = %e, "projection changed underneath, abstaining");
            stats.record(kind, RemedyAction::Abstain);
        }
        Err(e) => {
            warn!(kind, namespace = %namespace, name = %name, error = %e, "failed to delete orphan projection");
            stats.record(kind, RemedyAction::Failed);
        }
    }
}

/// [`DifferenceHandler`] applying the remediations of one patrol pass
pub struct RemedyHandler<'a, K: SyncObject, R> {
    syncer: &'a DownwardSyncer<K, R>,
    stats: &'a PatrolStats,
}

impl<'a, K: SyncObject, R: SyncRules<K>> RemedyHandler<'a, K, R> {
    /// Handler remediating through `syncer`'s collaborators, counting into `stats`
    pub fn new(syncer: &'a DownwardSyncer<K, R>, stats: &'a PatrolStats) -> Self {
        Self { syncer, stats }
    }

    fn kind(&self) -> &'static str {
        self.syncer.rules.kind()
    }
}

#[async_trait]
impl<'a, K: SyncObject, R: SyncRules<K>> DifferenceHandler<K> for RemedyHandler<'a, K, R> {
    async fn on_add(&self, obj: &ClusterObject<K>) {
        requeue_tenant(self.kind(), self.syncer.mc.as_ref(), self.stats, obj).await;
    }

    async fn on_update(&self, obj: &ClusterObject<K>, other: &ClusterObject<K>) {
        if other.delegated_uid() != obj.uid() {
            warn!(
                kind = self.kind(),
                key = %other.key(),
                "projection delegated UID is different from tenant object"
            );
            self.on_delete(other).await;
            return;
        }
        if self
            .syncer
            .rules
            .needs_requeue(obj.object(), other.object())
        {
            requeue_tenant(self.kind(), self.syncer.mc.as_ref(), self.stats, obj).await;
        }
    }

    async fn on_delete(&self, other: &ClusterObject<K>) {
        delete_orphan(self.kind(), self.syncer.client.as_ref(), self.stats, other).await;
    }
}

#[async_trait]
impl<K: SyncObject, R: SyncRules<K>> PatrolDo for DownwardSyncer<K, R> {
    fn kind(&self) -> &'static str {
        self.rules.kind()
    }

    fn has_synced(&self) -> bool {
        self.lister.has_synced()
    }

    #[instrument(skip(self), fields(kind = self.rules.kind()))]
    async fn patroller_do(&self) -> PatrolSummary {
        let kind = self.rules.kind();
        let snapshot =
            match take_snapshot(kind, self.mc.as_ref(), self.lister.as_ref(), self.list_timeout)
                .await
            {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => return PatrolSummary::skipped(),
                Err(e) => {
                    warn!(error = %e, "failed to list projections from the super-side cache");
                    return PatrolSummary::skipped();
                }
            };

        let stats = PatrolStats::new();
        snapshot
            .dispatch(&RemedyHandler::new(self, &stats))
            .await;
        stats.summary(&snapshot)
    }
}
