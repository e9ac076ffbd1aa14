//! Kind-specific behavior plugged into the shared sync engine

use syncer_common::mc::SyncObject;

/// How one resource kind is projected into the super control plane
pub trait SyncRules<K: SyncObject>: Send + Sync + 'static {
    /// Lowercase kind name used for logs, metrics and configuration
    fn kind(&self) -> &'static str;

    /// Build the super-side projection of `tenant` in `target_namespace`
    fn build_projection(&self, cluster_key: &str, target_namespace: &str, tenant: &K) -> K;

    /// The object to send as an update so `live` matches `tenant`, or `None`
    /// if `live` is already up to date.
    ///
    /// Fields the super control plane assigns itself are taken from `live`.
    fn desired_update(&self, live: &K, tenant: &K) -> Option<K>;

    /// Patrol check for a tenant object and its projection (UIDs already
    /// matched): true if the tenant object should go back on the event path
    fn needs_requeue(&self, tenant: &K, projection: &K) -> bool;
}
