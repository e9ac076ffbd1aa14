//! Resource kinds the syncer can run
//!
//! Kinds are listed explicitly in [`builtin_resources`]; the binary picks the
//! configured subset at startup. Each kind gets one syncer, shared by its
//! patroller and by one tenant controller per tenant cluster.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use syncer_common::mc::kube_impl::{KubeMultiClusterController, KubeSuperClient, ReflectorSuperLister};
use syncer_common::mc::{SyncObject, TenantRequest};
use syncer_common::{Error, Result};
use syncer_patrol::patroller::PatrolDo;

use crate::controller::{tenant_controller, BoxedTask, ControllerOptions, TenantContext};
use crate::dws::{DownwardSyncer, SyncOutcome};
use crate::rules::SyncRules;
use crate::service::ServiceRules;
use crate::serviceaccount::ServiceAccountRules;

/// A synced resource kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// core/v1 Service
    Service,
    /// core/v1 ServiceAccount
    ServiceAccount,
}

impl ResourceKind {
    /// Every kind, in startup order
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Service, ResourceKind::ServiceAccount];

    /// Lowercase name used in configuration, logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::ServiceAccount => "serviceaccount",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::config(format!("unknown resource kind: {s}")))
    }
}

/// A running downward-sync controller, type-erased over its kind
#[async_trait]
pub trait ResourceSyncer: PatrolDo {
    /// Reconcile one tenant request
    async fn reconcile(&self, request: &TenantRequest) -> Result<SyncOutcome>;

    /// This syncer as the patrol pass of its kind
    fn as_patrol(self: Arc<Self>) -> Arc<dyn PatrolDo>;
}

#[async_trait]
impl<K: SyncObject, R: SyncRules<K>> ResourceSyncer for DownwardSyncer<K, R> {
    async fn reconcile(&self, request: &TenantRequest) -> Result<SyncOutcome> {
        DownwardSyncer::reconcile(self, request).await
    }

    fn as_patrol(self: Arc<Self>) -> Arc<dyn PatrolDo> {
        self
    }
}

/// Clients and lifetime shared by every syncer built at startup
#[derive(Clone)]
pub struct SyncerContext {
    /// Client for the super control plane
    pub super_client: Client,
    /// Tenant clients keyed by cluster key
    pub tenants: Arc<BTreeMap<String, Client>>,
    /// Upper bound on listing one tenant cluster during a patrol
    pub list_timeout: Duration,
    /// Concurrency and retry timing of the tenant controllers
    pub controller: ControllerOptions,
    /// Stops the watches and tenant controllers
    pub cancel: CancellationToken,
}

/// The syncer of one kind and the controllers driving its event path
pub struct KindRuntime {
    /// Syncer shared by the controllers and the patrol
    pub syncer: Arc<dyn ResourceSyncer>,
    /// One controller task per tenant cluster
    pub controllers: Vec<BoxedTask>,
}

/// Builds the runtime of one kind
pub type SyncerFactory = fn(&SyncerContext) -> KindRuntime;

/// One entry of [`builtin_resources`]
#[derive(Clone, Copy)]
pub struct ResourceRegistration {
    /// Kind this entry builds
    pub kind: ResourceKind,
    /// Constructor
    pub factory: SyncerFactory,
}

impl fmt::Debug for ResourceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistration")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Every kind this build can sync
pub fn builtin_resources() -> Vec<ResourceRegistration> {
    vec![
        ResourceRegistration {
            kind: ResourceKind::Service,
            factory: |ctx| kube_runtime::<Service, _>(ServiceRules, ctx),
        },
        ResourceRegistration {
            kind: ResourceKind::ServiceAccount,
            factory: |ctx| kube_runtime::<ServiceAccount, _>(ServiceAccountRules, ctx),
        },
    ]
}

fn kube_runtime<K, R>(rules: R, ctx: &SyncerContext) -> KindRuntime
where
    K: SyncObject + Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned,
    R: SyncRules<K>,
{
    let (mc, requeues) = KubeMultiClusterController::<K>::new(ctx.tenants.clone());
    let client = KubeSuperClient::<K>::new(ctx.super_client.clone());
    let lister = ReflectorSuperLister::<K>::spawn(ctx.super_client.clone(), ctx.cancel.clone());
    let syncer: Arc<dyn ResourceSyncer> = Arc::new(
        DownwardSyncer::new(rules, Arc::new(mc), Arc::new(client), Arc::new(lister))
            .with_list_timeout(ctx.list_timeout),
    );

    let mut controllers = Vec::with_capacity(requeues.len());
    for (cluster, requeue_rx) in requeues {
        let Some(client) = ctx.tenants.get(&cluster).cloned() else {
            warn!(cluster = %cluster, "no client for tenant cluster");
            continue;
        };
        let tenant_ctx = Arc::new(TenantContext {
            cluster,
            syncer: syncer.clone(),
            options: ctx.controller.clone(),
        });
        controllers.push(tenant_controller::<K>(
            client,
            tenant_ctx,
            requeue_rx,
            ctx.cancel.clone(),
        ));
    }

    KindRuntime {
        syncer,
        controllers,
    }
}
