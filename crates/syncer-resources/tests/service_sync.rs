//! Service downward sync and patrol against in-memory control planes

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use syncer_common::conversion::{super_namespace, TenantRef};
use syncer_common::fake::{Action, FakeSuperCluster, FakeTenantClusters};
use syncer_common::mc::{Preconditions, TenantRequest};
use syncer_common::{
    CONTROLLED_BY_SYNCER, LABEL_CLUSTER, LABEL_CONTROLLED_BY, LABEL_NAMESPACE, LABEL_UID,
};
use syncer_patrol::PatrolDo;
use syncer_resources::{ServiceRules, ServiceSyncer, SyncOutcome};

fn cluster_key() -> String {
    TenantRef::new("test", "tenant-1", "7374a172-c35d-45b1-9c8e-bf5c5b614937").cluster_key()
}

fn super_default_ns() -> String {
    super_namespace(&cluster_key(), "default")
}

fn tenant_service(name: &str, uid: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn super_service(name: &str, delegated_uid: &str, cluster: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(super_namespace(cluster, "default")),
            uid: Some(format!("super-{name}")),
            labels: Some(BTreeMap::from([(
                LABEL_CONTROLLED_BY.to_string(),
                CONTROLLED_BY_SYNCER.to_string(),
            )])),
            annotations: Some(BTreeMap::from([
                (LABEL_UID.to_string(), delegated_uid.to_string()),
                (LABEL_NAMESPACE.to_string(), "default".to_string()),
                (LABEL_CLUSTER.to_string(), cluster.to_string()),
            ])),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn with_cluster_ip(mut svc: Service, ip: &str) -> Service {
    let spec = svc.spec.get_or_insert_with(ServiceSpec::default);
    spec.cluster_ip = Some(ip.to_string());
    spec.cluster_ips = Some(vec![ip.to_string()]);
    svc
}

fn with_spec(mut svc: Service, ip: &str, selector: (&str, &str)) -> Service {
    svc.spec = Some(ServiceSpec {
        type_: Some("ClusterIP".to_string()),
        cluster_ip: Some(ip.to_string()),
        selector: Some(BTreeMap::from([(
            selector.0.to_string(),
            selector.1.to_string(),
        )])),
        ..Default::default()
    });
    svc
}

struct Harness {
    tenants: Arc<FakeTenantClusters<Service>>,
    client: Arc<FakeSuperCluster<Service>>,
    lister: Arc<FakeSuperCluster<Service>>,
    syncer: ServiceSyncer,
}

impl Harness {
    /// Client and lister share one store, like a fully synced cache
    fn new(super_objects: Vec<Service>) -> Self {
        let store = Arc::new(FakeSuperCluster::with_objects(super_objects));
        Self::split(store.clone(), store)
    }

    /// Client and lister see different states, like a lagging cache
    fn split(client: Arc<FakeSuperCluster<Service>>, lister: Arc<FakeSuperCluster<Service>>) -> Self {
        let tenants = Arc::new(FakeTenantClusters::new());
        tenants.add_cluster(&cluster_key());
        let syncer = ServiceSyncer::new(
            ServiceRules,
            tenants.clone(),
            client.clone(),
            lister.clone(),
        );
        Self {
            tenants,
            client,
            lister,
            syncer,
        }
    }

    fn with_tenant(self, svc: Service) -> Self {
        self.tenants.insert(&cluster_key(), svc);
        self
    }

    async fn reconcile(&self, name: &str, uid: &str) -> syncer_common::Result<SyncOutcome> {
        self.syncer
            .reconcile(&TenantRequest::new(cluster_key(), "default", name, uid))
            .await
    }
}

// =============================================================================
// Creation
// =============================================================================

#[tokio::test]
async fn story_new_service_is_projected() {
    let h = Harness::new(vec![]).with_tenant(tenant_service("svc-1", "12345"));

    let outcome = h.reconcile("svc-1", "12345").await.unwrap();
    assert_eq!(outcome, SyncOutcome::Created);

    let actions = h.client.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].verb(), "create");
    assert_eq!(actions[0].full_name(), format!("{}/svc-1", super_default_ns()));

    let created = h.client.object(&super_default_ns(), "svc-1").unwrap();
    let annotations = created.metadata.annotations.unwrap();
    assert_eq!(annotations.get(LABEL_UID).map(String::as_str), Some("12345"));
    assert_eq!(annotations.get(LABEL_CLUSTER), Some(&cluster_key()));
    assert_eq!(annotations.get(LABEL_NAMESPACE).map(String::as_str), Some("default"));
}

#[tokio::test]
async fn test_new_service_with_cluster_ip_drops_it() {
    let tenant = with_cluster_ip(tenant_service("svc-1", "12345"), "1.1.1.1");
    let h = Harness::new(vec![]).with_tenant(tenant);

    h.reconcile("svc-1", "12345").await.unwrap();

    let created = h.client.actions()[0].object().cloned().unwrap();
    let spec = created.spec.unwrap();
    assert_eq!(spec.cluster_ip, None);
    assert_eq!(spec.cluster_ips, None);
}

#[tokio::test]
async fn test_new_service_already_projected_is_noop() {
    let h = Harness::new(vec![super_service("svc-1", "12345", &cluster_key())])
        .with_tenant(tenant_service("svc-1", "12345"));

    let outcome = h.reconcile("svc-1", "12345").await.unwrap();
    assert_eq!(outcome, SyncOutcome::Unchanged);
    assert!(h.client.actions().is_empty());
}

/// Story: a cache that has not seen our earlier create does not cause a conflict
#[tokio::test]
async fn story_create_against_stale_cache_is_idempotent() {
    let client = Arc::new(FakeSuperCluster::with_objects([super_service(
        "svc-1",
        "12345",
        &cluster_key(),
    )]));
    let lister = Arc::new(FakeSuperCluster::new());
    let h = Harness::split(client, lister).with_tenant(tenant_service("svc-1", "12345"));

    let outcome = h.reconcile("svc-1", "12345").await.unwrap();
    assert_eq!(outcome, SyncOutcome::Unchanged);

    let actions = h.client.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].verb(), "create");
    assert!(h.lister.actions().is_empty());
}

/// Story: the same create delivered twice leaves one projection behind
#[tokio::test]
async fn story_repeated_create_is_idempotent() {
    let h = Harness::new(vec![]).with_tenant(tenant_service("svc-1", "12345"));

    assert_eq!(h.reconcile("svc-1", "12345").await.unwrap(), SyncOutcome::Created);
    assert_eq!(h.reconcile("svc-1", "12345").await.unwrap(), SyncOutcome::Unchanged);

    let creates: Vec<_> = h
        .client
        .actions()
        .into_iter()
        .filter(|a| a.verb() == "create")
        .collect();
    assert_eq!(creates.len(), 1);
    assert_eq!(h.client.object_count(), 1);
}

/// Story: a same-named projection of another tenant object is never adopted
#[tokio::test]
async fn story_create_conflicts_with_foreign_projection() {
    let h = Harness::new(vec![super_service("svc-1", "123456", &cluster_key())])
        .with_tenant(tenant_service("svc-1", "12345"));

    let err = h.reconcile("svc-1", "12345").await.unwrap_err();
    assert!(err.to_string().contains("delegated UID is different"));
    assert!(h.client.actions().is_empty());
}

#[tokio::test]
async fn test_stale_cache_create_conflicts_with_foreign_projection() {
    let client = Arc::new(FakeSuperCluster::with_objects([super_service(
        "svc-1",
        "123456",
        &cluster_key(),
    )]));
    let h = Harness::split(client, Arc::new(FakeSuperCluster::new()))
        .with_tenant(tenant_service("svc-1", "12345"));

    let err = h.reconcile("svc-1", "12345").await.unwrap_err();
    assert!(err.is_ownership_conflict());
}

// =============================================================================
// Deletion
// =============================================================================

#[tokio::test]
async fn story_deleted_tenant_service_removes_projection() {
    let h = Harness::new(vec![super_service("svc-1", "12345", &cluster_key())]);

    let outcome = h.reconcile("svc-1", "12345").await.unwrap();
    assert_eq!(outcome, SyncOutcome::Deleted);
    assert_eq!(
        h.client.actions(),
        vec![Action::Delete {
            namespace: super_default_ns(),
            name: "svc-1".to_string(),
            preconditions: Preconditions::uid("super-svc-1"),
        }]
    );
    assert_eq!(h.client.object_count(), 0);
}

#[tokio::test]
async fn test_delete_of_absent_projection_is_noop() {
    let h = Harness::new(vec![]);

    let outcome = h.reconcile("svc-1", "12345").await.unwrap();
    assert_eq!(outcome, SyncOutcome::Unchanged);
    assert!(h.client.actions().is_empty());
}

#[tokio::test]
async fn test_delete_refuses_foreign_projection() {
    let h = Harness::new(vec![super_service("svc-1", "123456", &cluster_key())]);

    let err = h.reconcile("svc-1", "12345").await.unwrap_err();
    assert!(err.to_string().contains("delegated UID is different"));
    assert!(h.client.actions().is_empty());
    assert_eq!(h.client.object_count(), 1);
}

// =============================================================================
// Update
// =============================================================================

#[tokio::test]
async fn test_cluster_ip_difference_is_not_synced() {
    let projection = with_spec(
        super_service("svc-1", "12345", &cluster_key()),
        "1.1.1.1",
        ("a", "b"),
    );
    let tenant = with_spec(tenant_service("svc-1", "12345"), "2.2.2.2", ("a", "b"));
    let h = Harness::new(vec![projection]).with_tenant(tenant);

    let outcome = h.reconcile("svc-1", "12345").await.unwrap();
    assert_eq!(outcome, SyncOutcome::Unchanged);
    assert!(h.client.actions().is_empty());
}

/// Story: a selector change reaches the projection, its cluster IP stays
#[tokio::test]
async fn story_selector_change_is_synced() {
    let projection = with_spec(
        super_service("svc-1", "12345", &cluster_key()),
        "1.1.1.1",
        ("a", "b"),
    );
    let tenant = with_spec(tenant_service("svc-1", "12345"), "3.3.3.3", ("b", "c"));
    let h = Harness::new(vec![projection]).with_tenant(tenant);

    let outcome = h.reconcile("svc-1", "12345").await.unwrap();
    assert_eq!(outcome, SyncOutcome::Updated);

    let expected = with_spec(
        super_service("svc-1", "12345", &cluster_key()),
        "1.1.1.1",
        ("b", "c"),
    );
    assert_eq!(
        h.client.actions(),
        vec![Action::Update {
            namespace: super_default_ns(),
            object: expected,
        }]
    );
}

#[tokio::test]
async fn test_update_refuses_foreign_projection() {
    let projection = with_spec(
        super_service("svc-1", "12345", &cluster_key()),
        "1.1.1.1",
        ("a", "b"),
    );
    let tenant = with_spec(tenant_service("svc-1", "123456"), "3.3.3.3", ("b", "c"));
    let h = Harness::new(vec![projection]).with_tenant(tenant);

    let err = h.reconcile("svc-1", "123456").await.unwrap_err();
    assert!(err.to_string().contains("delegated UID is different"));
    assert!(h.client.actions().is_empty());
}

/// Story: the projection was deleted after the cache saw it, so the update
/// finds nothing and the reconcile counts as converged
#[tokio::test]
async fn story_update_of_vanished_projection_is_converged() {
    let client = Arc::new(FakeSuperCluster::new());
    let lister = Arc::new(FakeSuperCluster::with_objects([with_spec(
        super_service("svc-1", "12345", &cluster_key()),
        "1.1.1.1",
        ("a", "b"),
    )]));
    let tenant = with_spec(tenant_service("svc-1", "12345"), "3.3.3.3", ("b", "c"));
    let h = Harness::split(client, lister).with_tenant(tenant);

    let outcome = h.reconcile("svc-1", "12345").await.unwrap();
    assert_eq!(outcome, SyncOutcome::Unchanged);

    let actions = h.client.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].verb(), "update");
    assert_eq!(h.client.object_count(), 0);
}

// =============================================================================
// Patrol
// =============================================================================

#[tokio::test]
async fn test_patrol_requeues_unprojected_tenant_service() {
    let h = Harness::new(vec![]).with_tenant(tenant_service("svc-1", "12345"));

    let summary = h.syncer.patroller_do().await;
    assert_eq!(summary.requeued, 1);
    assert_eq!(
        h.tenants.requeued(),
        vec![TenantRequest::new(cluster_key(), "default", "svc-1", "12345")]
    );
    assert!(h.client.actions().is_empty());
}

#[tokio::test]
async fn test_patrol_requeues_drifted_service() {
    let projection = with_spec(
        super_service("svc-1", "12345", &cluster_key()),
        "1.1.1.1",
        ("a", "b"),
    );
    let tenant = with_spec(tenant_service("svc-1", "12345"), "1.1.1.1", ("b", "c"));
    let h = Harness::new(vec![projection]).with_tenant(tenant);

    let summary = h.syncer.patroller_do().await;
    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.deleted_orphans, 0);
    assert!(h.client.actions().is_empty());
}

#[tokio::test]
async fn test_patrol_leaves_converged_service_alone() {
    let projection = with_spec(
        super_service("svc-1", "12345", &cluster_key()),
        "1.1.1.1",
        ("a", "b"),
    );
    let tenant = with_spec(tenant_service("svc-1", "12345"), "1.1.1.1", ("a", "b"));
    let h = Harness::new(vec![projection]).with_tenant(tenant);

    let summary = h.syncer.patroller_do().await;
    assert_eq!(summary.requeued, 0);
    assert!(h.tenants.requeued().is_empty());
    assert!(h.client.actions().is_empty());
}

/// Story: a projection left behind by a re-created tenant object is removed
#[tokio::test]
async fn story_patrol_deletes_projection_with_stale_delegated_uid() {
    let h = Harness::new(vec![super_service("svc-1", "old-uid", &cluster_key())])
        .with_tenant(tenant_service("svc-1", "12345"));

    let summary = h.syncer.patroller_do().await;
    assert_eq!(summary.deleted_orphans, 1);
    assert_eq!(
        h.client.actions(),
        vec![Action::Delete {
            namespace: super_default_ns(),
            name: "svc-1".to_string(),
            preconditions: Preconditions::uid("super-svc-1"),
        }]
    );
}

/// Story: orphans of an unknown cluster survive until the cluster is known
#[tokio::test]
async fn story_patrol_orphan_waits_for_owner_cluster() {
    let other = TenantRef::new("other", "tenant-2", "d2a4c0b8-0000-4000-8000-000000000002").cluster_key();
    let h = Harness::new(vec![super_service("svc-9", "99999", &other)]);

    let summary = h.syncer.patroller_do().await;
    assert_eq!(summary.deleted_orphans, 0);
    assert!(h.client.actions().is_empty());

    h.tenants.add_cluster(&other);
    let summary = h.syncer.patroller_do().await;
    assert_eq!(summary.deleted_orphans, 1);
    assert_eq!(
        h.client.actions(),
        vec![Action::Delete {
            namespace: super_namespace(&other, "default"),
            name: "svc-9".to_string(),
            preconditions: Preconditions::uid("super-svc-9"),
        }]
    );
}

#[tokio::test]
async fn test_patrol_spares_projections_of_unreachable_cluster() {
    let h = Harness::new(vec![super_service("svc-1", "12345", &cluster_key())]);
    h.tenants.set_list_failure(&cluster_key(), true);

    let summary = h.syncer.patroller_do().await;
    assert_eq!(summary.known_clusters, 0);
    assert_eq!(summary.unreachable_clusters, 1);
    assert_eq!(summary.deleted_orphans, 0);
    assert!(h.client.actions().is_empty());
}

/// Story: the projection was re-created after the cache snapshot, so the delete abstains
#[tokio::test]
async fn story_patrol_abstains_when_projection_was_replaced() {
    let mut replaced = super_service("svc-1", "12345", &cluster_key());
    replaced.metadata.uid = Some("super-svc-1-new".to_string());
    let client = Arc::new(FakeSuperCluster::with_objects([replaced]));
    let lister = Arc::new(FakeSuperCluster::with_objects([super_service(
        "svc-1",
        "12345",
        &cluster_key(),
    )]));
    let h = Harness::split(client, lister);

    let summary = h.syncer.patroller_do().await;
    assert_eq!(summary.deleted_orphans, 0);
    assert_eq!(summary.abstained, 1);
    assert_eq!(h.client.actions().len(), 1);
    assert_eq!(h.client.object_count(), 1);
}

#[tokio::test]
async fn test_patrol_without_clusters_is_skipped() {
    let h = Harness::new(vec![super_service("svc-1", "12345", &cluster_key())]);
    h.tenants.remove_cluster(&cluster_key());

    let summary = h.syncer.patroller_do().await;
    assert!(summary.skipped);
    assert!(h.client.actions().is_empty());
}
