//! Tenant to super-cluster naming scheme and projection metadata
//!
//! Every tenant gets a stable cluster key; each of its namespaces maps to
//! exactly one super-side namespace derived from that key, so objects from
//! different tenants never collide in the shared control plane.

use std::collections::BTreeMap;
use std::fmt::Write;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::{
    CONTROLLED_BY_SYNCER, LABEL_CLUSTER, LABEL_CONTROLLED_BY, LABEL_NAMESPACE, LABEL_UID,
    TENANCY_PREFIX,
};

/// Maximum length of a DNS-1123 label (namespace names)
pub const DNS1123_LABEL_MAX_LENGTH: usize = 63;

/// Annotation kubectl writes on client-side apply; never projected
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Identity of a tenant control plane
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantRef {
    /// Name of the tenant object
    pub name: String,
    /// Namespace the tenant object lives in on the super cluster
    pub namespace: String,
    /// UID of the tenant object
    pub uid: String,
}

impl TenantRef {
    /// Create a tenant reference
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: uid.into(),
        }
    }

    /// Cluster key of this tenant, see [`cluster_key`]
    pub fn cluster_key(&self) -> String {
        cluster_key(self)
    }
}

/// Stable key identifying a tenant: `<namespace>-<6 hex of sha256(uid)>-<name>`.
///
/// Tenants without a namespace use their bare name.
pub fn cluster_key(tenant: &TenantRef) -> String {
    if tenant.namespace.is_empty() {
        return tenant.name.clone();
    }
    let digest = sha256_hex(&tenant.uid);
    format!("{}-{}-{}", tenant.namespace, &digest[..6], tenant.name)
}

/// Super-side namespace hosting `tenant_namespace` of the tenant `cluster_key`.
///
/// Names longer than a DNS-1123 label are truncated and suffixed with a
/// digest of the full name so distinct inputs stay distinct.
pub fn super_namespace(cluster_key: &str, tenant_namespace: &str) -> String {
    let target = format!("{cluster_key}-{tenant_namespace}");
    if target.len() <= DNS1123_LABEL_MAX_LENGTH {
        return target;
    }
    let digest = sha256_hex(&target);
    let mut keep = DNS1123_LABEL_MAX_LENGTH - 6;
    while !target.is_char_boundary(keep) {
        keep -= 1;
    }
    format!("{}-{}", target[..keep].trim_end_matches('-'), &digest[..5])
}

/// True when `value` is a valid DNS-1123 label: at most 63 lowercase
/// alphanumerics or '-', starting and ending with an alphanumeric
pub fn is_dns1123_label(value: &str) -> bool {
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    value.len() <= DNS1123_LABEL_MAX_LENGTH
        && value.starts_with(alnum)
        && value.ends_with(alnum)
        && value.chars().all(|c| alnum(c) || c == '-')
}

fn sha256_hex(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Build the metadata of a super-side projection of a tenant object.
///
/// Keeps the tenant's name, labels and annotations, stamps the delegated UID,
/// tenant namespace and cluster key annotations plus the controlled-by label,
/// and drops everything the super cluster assigns itself (uid,
/// resourceVersion, timestamps, owner references, managed fields).
pub fn build_super_metadata<K: Resource>(
    cluster_key: &str,
    target_namespace: &str,
    tenant: &K,
) -> ObjectMeta {
    let meta = tenant.meta();

    let mut labels = meta.labels.clone().unwrap_or_default();
    labels.insert(
        LABEL_CONTROLLED_BY.to_string(),
        CONTROLLED_BY_SYNCER.to_string(),
    );

    let mut annotations = meta.annotations.clone().unwrap_or_default();
    annotations.remove(LAST_APPLIED_ANNOTATION);
    annotations.insert(LABEL_CLUSTER.to_string(), cluster_key.to_string());
    annotations.insert(
        LABEL_NAMESPACE.to_string(),
        meta.namespace.clone().unwrap_or_default(),
    );
    annotations.insert(
        LABEL_UID.to_string(),
        meta.uid.clone().unwrap_or_default(),
    );

    ObjectMeta {
        name: meta.name.clone(),
        namespace: Some(target_namespace.to_string()),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    }
}

/// Delegated UID recorded on a super-side object, if any
pub fn delegated_uid<K: Resource>(obj: &K) -> Option<&str> {
    annotation(obj, LABEL_UID)
}

/// Cluster key recorded on a super-side object, if any
pub fn owner_cluster<K: Resource>(obj: &K) -> Option<&str> {
    annotation(obj, LABEL_CLUSTER)
}

/// Tenant namespace recorded on a super-side object, if any
pub fn tenant_namespace<K: Resource>(obj: &K) -> Option<&str> {
    annotation(obj, LABEL_NAMESPACE)
}

fn annotation<'a, K: Resource>(obj: &'a K, key: &str) -> Option<&'a str> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// True if the super-side object was projected from the tenant object with `tenant_uid`
pub fn is_delegated_from<K: Resource>(super_obj: &K, tenant_uid: &str) -> bool {
    delegated_uid(super_obj) == Some(tenant_uid)
}

/// Labels a projection should carry: the syncer's own labels from the live
/// super-side object, overlaid with the tenant's current labels.
pub fn desired_super_labels<K: Resource>(live: &K, tenant: &K) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = live
        .labels()
        .iter()
        .filter(|(k, _)| k.starts_with(TENANCY_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.extend(
        tenant
            .labels()
            .iter()
            .filter(|(k, _)| !k.starts_with(TENANCY_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    labels
}
