//! ServiceAccount downward sync
//!
//! Secret references on a tenant ServiceAccount name tenant-side secrets, so
//! the projection drops them; the super control plane manages the
//! projection's own tokens. Updates only sync labels.

use k8s_openapi::api::core::v1::ServiceAccount;
use kube::ResourceExt;

use syncer_common::conversion::{build_super_metadata, desired_super_labels};

use crate::dws::DownwardSyncer;
use crate::rules::SyncRules;

/// Downward-sync controller for ServiceAccounts
pub type ServiceAccountSyncer = DownwardSyncer<ServiceAccount, ServiceAccountRules>;

/// [`SyncRules`] for ServiceAccounts
#[derive(Clone, Copy, Debug, Default)]
pub struct ServiceAccountRules;

impl SyncRules<ServiceAccount> for ServiceAccountRules {
    fn kind(&self) -> &'static str {
        "serviceaccount"
    }

    fn build_projection(
        &self,
        cluster_key: &str,
        target_namespace: &str,
        tenant: &ServiceAccount,
    ) -> ServiceAccount {
        ServiceAccount {
            metadata: build_super_metadata(cluster_key, target_namespace, tenant),
            automount_service_account_token: tenant.automount_service_account_token,
            secrets: None,
            image_pull_secrets: None,
        }
    }

    fn desired_update(&self, live: &ServiceAccount, tenant: &ServiceAccount) -> Option<ServiceAccount> {
        let labels = desired_super_labels(live, tenant);
        if &labels == live.labels() {
            return None;
        }
        let mut updated = live.clone();
        updated.metadata.labels = Some(labels);
        Some(updated)
    }

    /// A tenant ServiceAccount whose token secret has not been populated yet
    /// goes back on the event path
    fn needs_requeue(&self, tenant: &ServiceAccount, _projection: &ServiceAccount) -> bool {
        tenant.secrets.as_ref().map_or(true, Vec::is_empty)
    }
}
