//! Service downward sync
//!
//! A projected Service carries the tenant's spec minus everything the super
//! control plane allocates for itself: cluster IPs (unless headless), node
//! ports and the health check node port. Updates merge the tenant spec with
//! those allocations from the live projection, so a selector change never
//! releases the projection's cluster IP.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::ResourceExt;

use syncer_common::conversion::{build_super_metadata, desired_super_labels};

use crate::dws::DownwardSyncer;
use crate::rules::SyncRules;

/// Cluster IP value marking a headless service
pub const HEADLESS_CLUSTER_IP: &str = "None";

/// Downward-sync controller for Services
pub type ServiceSyncer = DownwardSyncer<Service, ServiceRules>;

/// [`SyncRules`] for Services
#[derive(Clone, Copy, Debug, Default)]
pub struct ServiceRules;

impl SyncRules<Service> for ServiceRules {
    fn kind(&self) -> &'static str {
        "service"
    }

    fn build_projection(&self, cluster_key: &str, target_namespace: &str, tenant: &Service) -> Service {
        build_super_service(cluster_key, target_namespace, tenant)
    }

    fn desired_update(&self, live: &Service, tenant: &Service) -> Option<Service> {
        desired_super_service(live, tenant)
    }

    fn needs_requeue(&self, tenant: &Service, projection: &Service) -> bool {
        desired_super_service(projection, tenant).is_some()
    }
}

/// Build the super-side projection of a tenant Service
pub fn build_super_service(cluster_key: &str, target_namespace: &str, tenant: &Service) -> Service {
    let mut spec = tenant.spec.clone().unwrap_or_default();
    if !is_headless(&spec) {
        spec.cluster_ip = None;
        spec.cluster_ips = None;
    }
    for port in spec.ports.iter_mut().flatten() {
        port.node_port = None;
    }
    spec.health_check_node_port = None;

    Service {
        metadata: build_super_metadata(cluster_key, target_namespace, tenant),
        spec: Some(spec),
        status: None,
    }
}

/// The update that brings `live` in line with `tenant`, or `None` if nothing differs.
///
/// The desired spec is the tenant spec with cluster IPs, node ports and the
/// health check node port taken from `live`; IP family fields the tenant
/// leaves unset are taken from `live` too.
pub fn desired_super_service(live: &Service, tenant: &Service) -> Option<Service> {
    let live_spec = live.spec.clone().unwrap_or_default();
    let spec = merge_allocated_fields(tenant.spec.clone().unwrap_or_default(), &live_spec);
    let labels = desired_super_labels(live, tenant);

    let spec_changed = spec != live_spec;
    let labels_changed = &labels != live.labels();
    if !spec_changed && !labels_changed {
        return None;
    }

    let mut updated = live.clone();
    updated.spec = Some(spec);
    if labels_changed {
        updated.metadata.labels = Some(labels);
    }
    Some(updated)
}

fn is_headless(spec: &ServiceSpec) -> bool {
    spec.cluster_ip.as_deref() == Some(HEADLESS_CLUSTER_IP)
}

fn merge_allocated_fields(mut spec: ServiceSpec, live: &ServiceSpec) -> ServiceSpec {
    spec.cluster_ip = live.cluster_ip.clone();
    spec.cluster_ips = live.cluster_ips.clone();
    spec.health_check_node_port = live.health_check_node_port;

    let live_node_ports: BTreeMap<(i32, String), i32> = live
        .ports
        .iter()
        .flatten()
        .filter_map(|p| p.node_port.map(|node_port| (port_key(p), node_port)))
        .collect();
    for port in spec.ports.iter_mut().flatten() {
        port.node_port = live_node_ports.get(&port_key(port)).copied();
    }

    if spec.ip_families.is_none() {
        spec.ip_families = live.ip_families.clone();
    }
    if spec.ip_family_policy.is_none() {
        spec.ip_family_policy = live.ip_family_policy.clone();
    }
    spec
}

fn port_key(port: &ServicePort) -> (i32, String) {
    (
        port.port,
        port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use syncer_common::{CONTROLLED_BY_SYNCER, LABEL_CONTROLLED_BY, LABEL_UID};

    fn spec(cluster_ip: &str, selector: (&str, &str)) -> ServiceSpec {
        ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some(cluster_ip.to_string()),
            selector: Some(BTreeMap::from([(
                selector.0.to_string(),
                selector.1.to_string(),
            )])),
            ..Default::default()
        }
    }

    fn tenant(spec: ServiceSpec) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("svc-1".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("12345".to_string()),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }

    fn live(spec: ServiceSpec) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("svc-1".to_string()),
                namespace: Some("key-default".to_string()),
                uid: Some("super-1".to_string()),
                annotations: Some(BTreeMap::from([(
                    LABEL_UID.to_string(),
                    "12345".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }

    fn node_port(port: i32, node_port: Option<i32>) -> ServicePort {
        ServicePort {
            port,
            node_port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_projection_drops_allocated_fields() {
        let mut s = spec("1.1.1.1", ("a", "b"));
        s.cluster_ips = Some(vec!["1.1.1.1".to_string()]);
        s.type_ = Some("NodePort".to_string());
        s.ports = Some(vec![node_port(80, Some(30080))]);
        s.health_check_node_port = Some(31000);

        let p = build_super_service("key", "key-default", &tenant(s));
        let p_spec = p.spec.unwrap();
        assert_eq!(p_spec.cluster_ip, None);
        assert_eq!(p_spec.cluster_ips, None);
        assert_eq!(p_spec.ports.unwrap()[0].node_port, None);
        assert_eq!(p_spec.health_check_node_port, None);
        assert_eq!(p.metadata.namespace.as_deref(), Some("key-default"));
        assert_eq!(
            p.metadata.labels.unwrap().get(LABEL_CONTROLLED_BY).map(String::as_str),
            Some(CONTROLLED_BY_SYNCER)
        );
    }

    #[test]
    fn test_headless_service_keeps_cluster_ip() {
        let p = build_super_service("key", "key-default", &tenant(spec("None", ("a", "b"))));
        assert_eq!(p.spec.unwrap().cluster_ip.as_deref(), Some(HEADLESS_CLUSTER_IP));
    }

    #[test]
    fn test_cluster_ip_difference_alone_is_not_drift() {
        let update = desired_super_service(
            &live(spec("1.1.1.1", ("a", "b"))),
            &tenant(spec("2.2.2.2", ("a", "b"))),
        );
        assert!(update.is_none());
    }

    /// Story: a selector change is synced without releasing the allocated cluster IP
    #[test]
    fn story_selector_update_keeps_cluster_ip() {
        let current = live(spec("1.1.1.1", ("a", "b")));
        let update =
            desired_super_service(&current, &tenant(spec("3.3.3.3", ("b", "c")))).unwrap();

        let mut expected = current.clone();
        expected.spec = Some(spec("1.1.1.1", ("b", "c")));
        assert_eq!(update, expected);
    }

    #[test]
    fn test_node_ports_follow_matching_live_ports() {
        let mut live_spec = spec("1.1.1.1", ("a", "b"));
        live_spec.ports = Some(vec![node_port(80, Some(30080))]);
        let mut tenant_spec = spec("1.1.1.1", ("a", "b"));
        tenant_spec.ports = Some(vec![node_port(80, Some(31111)), node_port(443, None)]);

        let update = desired_super_service(&live(live_spec), &tenant(tenant_spec)).unwrap();
        let ports = update.spec.unwrap().ports.unwrap();
        assert_eq!(ports[0].node_port, Some(30080));
        assert_eq!(ports[1].node_port, None);
    }

    #[test]
    fn test_label_change_keeps_syncer_labels() {
        let mut current = live(spec("1.1.1.1", ("a", "b")));
        current.metadata.labels = Some(BTreeMap::from([
            (LABEL_CONTROLLED_BY.to_string(), CONTROLLED_BY_SYNCER.to_string()),
            ("team".to_string(), "a".to_string()),
        ]));
        let mut desired = tenant(spec("1.1.1.1", ("a", "b")));
        desired.metadata.labels = Some(BTreeMap::from([("team".to_string(), "b".to_string())]));

        let update = desired_super_service(&current, &desired).unwrap();
        let labels = update.metadata.labels.unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("b"));
        assert_eq!(
            labels.get(LABEL_CONTROLLED_BY).map(String::as_str),
            Some(CONTROLLED_BY_SYNCER)
        );
    }

    #[test]
    fn test_rules_requeue_only_on_drift() {
        let rules = ServiceRules;
        let current = live(spec("1.1.1.1", ("a", "b")));
        assert!(!rules.needs_requeue(&tenant(spec("1.1.1.1", ("a", "b"))), &current));
        assert!(rules.needs_requeue(&tenant(spec("1.1.1.1", ("x", "y"))), &current));
    }
}
