//! Engine runner - builds the task set for every configured resource kind
//!
//! For each kind the runner builds the kind's runtime (the syncer plus one
//! tenant controller per tenant cluster) and a patroller over the same
//! syncer. The caller decides how to drive the returned futures.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use syncer_common::{Error, Result};
use syncer_patrol::{PatrolOptions, Patroller};
use syncer_resources::{BoxedTask, KindRuntime, ResourceKind, ResourceRegistration, SyncerContext};

/// Pick the registrations for `kinds`, in the order given
pub fn select_resources(
    available: &[ResourceRegistration],
    kinds: &[ResourceKind],
) -> Result<Vec<ResourceRegistration>> {
    kinds
        .iter()
        .map(|kind| {
            available
                .iter()
                .find(|r| r.kind == *kind)
                .copied()
                .ok_or_else(|| {
                    Error::config_for_field("resources", format!("{kind} is not built in"))
                })
        })
        .collect()
}

/// Build the tasks of every registration against `ctx`
pub fn build_engine(
    ctx: &SyncerContext,
    registrations: &[ResourceRegistration],
    patrol: &PatrolOptions,
) -> Vec<BoxedTask> {
    let mut tasks = Vec::new();
    for registration in registrations {
        let runtime = (registration.factory)(ctx);
        info!(
            kind = %registration.kind,
            tenant_controllers = runtime.controllers.len(),
            "- downward syncer"
        );
        tasks.extend(build_kind_tasks(runtime, patrol, ctx.cancel.clone()));
    }
    tasks
}

/// Tasks of one kind: its tenant controllers and its patroller
pub fn build_kind_tasks(
    runtime: KindRuntime,
    patrol: &PatrolOptions,
    cancel: CancellationToken,
) -> Vec<BoxedTask> {
    let patroller = Patroller::new(runtime.syncer.as_patrol(), patrol.clone());
    let mut tasks = runtime.controllers;
    tasks.push(Box::pin(async move {
        if let Err(e) = patroller.start(cancel).await {
            error!(patroller = %patroller.name(), error = %e, "patroller stopped");
        }
    }));
    tasks
}
