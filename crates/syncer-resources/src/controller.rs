//! Tenant-side event path
//!
//! One [`Controller`] per tenant cluster and kind watches the tenant's objects
//! and reconciles each through the kind's [`ResourceSyncer`]. The controller
//! never runs two reconciles of the same namespace/name at once. Patrol
//! requeues arrive on the cluster's requeue channel and are fed in with
//! `reconcile_on`.
//!
//! A deleted tenant object leaves the controller's store, so its delete is
//! reconciled straight from the watch event. A failed delete is not retried
//! here; the patrol finds the orphaned projection on its next pass.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt, TryStreamExt};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use syncer_common::kube_utils::watcher_config;
use syncer_common::mc::{SyncObject, TenantRequest};
use syncer_common::{Error, Result};

use crate::dws::SyncOutcome;
use crate::registry::ResourceSyncer;

/// A task the binary drives to completion
pub type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Requeue delay after a transient failure
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Requeue delay after a failure only an outside change can fix
pub const DEFAULT_CONFLICT_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Concurrent reconciles per tenant controller
pub const DEFAULT_CONCURRENCY: u16 = 4;

/// How tenant controllers run and retry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Concurrent reconciles per tenant controller
    pub concurrency: u16,
    /// Requeue delay after a transient failure
    pub retry_delay: Duration,
    /// Requeue delay after an ownership conflict or other non-retryable error
    pub conflict_retry_delay: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry_delay: DEFAULT_RETRY_DELAY,
            conflict_retry_delay: DEFAULT_CONFLICT_RETRY_DELAY,
        }
    }
}

/// Shared state of one tenant controller
pub struct TenantContext {
    /// Cluster key of the watched tenant
    pub cluster: String,
    /// Syncer of the controller's kind
    pub syncer: Arc<dyn ResourceSyncer>,
    /// Retry timing
    pub options: ControllerOptions,
}

/// Reconcile a tenant object seen by the controller
pub async fn reconcile<K: SyncObject>(obj: Arc<K>, ctx: Arc<TenantContext>) -> Result<Action> {
    let request = TenantRequest::for_object(&ctx.cluster, obj.as_ref());
    let outcome = reconcile_request(ctx.syncer.as_ref(), &request).await?;
    debug!(kind = ctx.syncer.kind(), %request, ?outcome, "reconciled");
    // Drift on the super side is the patrol's job
    Ok(Action::await_change())
}

/// Requeue delay for a failed reconcile
pub fn error_policy<K: SyncObject>(obj: Arc<K>, error: &Error, ctx: Arc<TenantContext>) -> Action {
    let kind = ctx.syncer.kind();
    if error.is_retryable() {
        warn!(
            kind,
            cluster = %ctx.cluster,
            object = %ObjectRef::from_obj(obj.as_ref()),
            error = %error,
            "reconciliation failed"
        );
        Action::requeue(ctx.options.retry_delay)
    } else {
        error!(
            kind,
            cluster = %ctx.cluster,
            object = %ObjectRef::from_obj(obj.as_ref()),
            ownership_conflict = error.is_ownership_conflict(),
            error = %error,
            "reconciliation failed, waiting for an outside change"
        );
        Action::requeue(ctx.options.conflict_retry_delay)
    }
}

/// Reconcile the delete of `obj`, observed on the tenant watch.
///
/// When `store` already holds a re-created object of the same name the delete
/// is skipped; the controller reconciles the new object instead.
pub async fn reconcile_deleted<K: SyncObject>(
    obj: &K,
    ctx: &TenantContext,
    store: &Store<K>,
) -> Result<SyncOutcome> {
    let request = TenantRequest::for_object(&ctx.cluster, obj);
    if let Some(live) = store.get(&ObjectRef::from_obj(obj)) {
        if live.uid() != obj.uid() {
            debug!(kind = ctx.syncer.kind(), %request, "tenant object re-created, skipping delete");
            return Ok(SyncOutcome::Unchanged);
        }
    }
    reconcile_request(ctx.syncer.as_ref(), &request).await
}

async fn reconcile_request(
    syncer: &dyn ResourceSyncer,
    request: &TenantRequest,
) -> Result<SyncOutcome> {
    match AssertUnwindSafe(syncer.reconcile(request)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Error::internal_with_context(
            "reconcile",
            format!("panicked: {}", panic_message(panic.as_ref())),
        )),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Build the controller of one tenant cluster.
///
/// The returned task runs until `cancel` fires and in-flight reconciles
/// finish.
pub fn tenant_controller<K>(
    client: Client,
    ctx: Arc<TenantContext>,
    requeues: mpsc::Receiver<ObjectRef<K>>,
    cancel: CancellationToken,
) -> BoxedTask
where
    K: SyncObject + DeserializeOwned,
{
    let api: Api<K> = Api::all(client);
    let (store, writer) = reflector::store();
    let (deleted_tx, deleted_rx) = mpsc::unbounded_channel::<K>();

    let objects = watcher::watcher(api, watcher_config())
        .default_backoff()
        .reflect(writer)
        .inspect_ok(move |event| {
            if let watcher::Event::Delete(obj) = event {
                let _ = deleted_tx.send(obj.clone());
            }
        })
        .applied_objects();

    let (stop_tx, stop_rx) = futures::channel::oneshot::channel::<()>();
    let kind = ctx.syncer.kind();
    let cluster = ctx.cluster.clone();

    let controller = Controller::for_stream(objects, store.clone())
        .with_config(controller::Config::default().concurrency(ctx.options.concurrency))
        .reconcile_on(ReceiverStream::new(requeues))
        .graceful_shutdown_on(stop_rx.map(|_| ()))
        .run(reconcile::<K>, error_policy::<K>, ctx.clone())
        .for_each(move |result| {
            match result {
                Ok((obj_ref, action)) => {
                    debug!(kind, cluster = %cluster, object = %obj_ref, ?action, "reconciliation completed")
                }
                Err(controller::Error::ReconcilerFailed(..)) => {}
                Err(e) => warn!(kind, cluster = %cluster, error = %e, "tenant controller error"),
            }
            std::future::ready(())
        });

    // The sender lives in the watch stream, so this ends with the controller
    let deletes = UnboundedReceiverStream::new(deleted_rx).for_each_concurrent(
        usize::from(ctx.options.concurrency.max(1)),
        move |obj| {
            let ctx = ctx.clone();
            let store = store.clone();
            async move {
                match reconcile_deleted(&obj, &ctx, &store).await {
                    Ok(outcome) => debug!(
                        kind = ctx.syncer.kind(),
                        cluster = %ctx.cluster,
                        object = %ObjectRef::from_obj(&obj),
                        ?outcome,
                        "tenant delete reconciled"
                    ),
                    Err(e) => warn!(
                        kind = ctx.syncer.kind(),
                        cluster = %ctx.cluster,
                        object = %ObjectRef::from_obj(&obj),
                        error = %e,
                        "tenant delete failed, leaving it to the patrol"
                    ),
                }
            }
        },
    );

    let shutdown = async move {
        cancel.cancelled().await;
        let _ = stop_tx.send(());
    };

    Box::pin(async move {
        info!(kind, "- tenant controller");
        futures::join!(controller, deletes, shutdown);
    })
}
