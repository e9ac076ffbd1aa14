//! Periodic patrol driver
//!
//! A [`Patroller`] waits for the super-side cache to sync, then runs one
//! [`PatrolDo::patroller_do`] pass per period until cancelled. The pass itself
//! is kind-specific; [`take_snapshot`] does the listing half every kind shares.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use syncer_common::mc::{LabelSelector, MultiClusterController, SuperLister, SyncObject};
use syncer_common::metrics::{self, PatrolTimer, RemedyAction};
use syncer_common::{Error, Result};

use crate::differ::{ClusterObject, DiffSet, DifferenceHandler, FilteringHandler, KnownClusterFilter};

/// Default interval between patrol passes
pub const DEFAULT_PATROL_PERIOD: Duration = Duration::from_secs(60);

/// Default upper bound on listing one tenant cluster
pub const DEFAULT_LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for the super-side cache before giving up
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(600);

/// Default interval between cache sync checks
pub const DEFAULT_SYNC_POLL_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Snapshot
// =============================================================================

/// Both sides of one patrol pass
#[derive(Debug)]
pub struct PatrolSnapshot<K> {
    /// Objects listed from reachable tenant clusters
    pub tenant: DiffSet<K>,
    /// Projections listed from the super-side cache
    pub super_side: DiffSet<K>,
    /// Clusters listed successfully this pass
    pub known_clusters: BTreeSet<String>,
    /// Clusters whose listing failed or timed out this pass
    pub unreachable_clusters: BTreeSet<String>,
}

impl<K: SyncObject> PatrolSnapshot<K> {
    /// Dispatch the tenant/super differences to `handler`, dropping callbacks
    /// for objects owned by clusters that were not listed this pass
    pub async fn dispatch<H>(&self, handler: &H)
    where
        H: DifferenceHandler<K>,
    {
        let filtered =
            FilteringHandler::new(handler, KnownClusterFilter::new(self.known_clusters.clone()));
        self.tenant.difference(&self.super_side, &filtered).await;
    }
}

/// List the super-side cache and every tenant cluster.
///
/// Returns `Ok(None)` when no tenant cluster is registered. Tenant clusters
/// are listed concurrently; a cluster whose listing fails or exceeds
/// `list_timeout` is left out of the known set. A super-side listing failure
/// fails the whole pass.
pub async fn take_snapshot<K: SyncObject>(
    kind: &str,
    mc: &dyn MultiClusterController<K>,
    lister: &dyn SuperLister<K>,
    list_timeout: Duration,
) -> Result<Option<PatrolSnapshot<K>>> {
    let clusters = mc.cluster_names();
    if clusters.is_empty() {
        debug!(kind, "no tenant clusters registered, skipping patrol");
        return Ok(None);
    }

    let super_side: DiffSet<K> = lister
        .list(&LabelSelector::super_cluster_objects())?
        .into_iter()
        .map(ClusterObject::super_side)
        .collect();

    let listings = join_all(clusters.iter().map(|cluster| async move {
        let result = match tokio::time::timeout(list_timeout, mc.list(cluster)).await {
            Ok(result) => result,
            Err(_) => Err(Error::cluster_list(
                cluster.as_str(),
                kind,
                format!("listing timed out after {list_timeout:?}"),
            )),
        };
        (cluster, result)
    }))
    .await;

    let mut snapshot = PatrolSnapshot {
        tenant: DiffSet::new(),
        super_side,
        known_clusters: BTreeSet::new(),
        unreachable_clusters: BTreeSet::new(),
    };
    for (cluster, result) in listings {
        match result {
            Ok(objects) => {
                snapshot
                    .tenant
                    .extend(objects.into_iter().map(|obj| ClusterObject::tenant(cluster, obj)));
                snapshot.known_clusters.insert(cluster.clone());
            }
            Err(e) => {
                warn!(kind, cluster = %cluster, error = %e, "failed to list tenant cluster, excluding it from this pass");
                snapshot.unreachable_clusters.insert(cluster.clone());
            }
        }
    }

    Ok(Some(snapshot))
}

// =============================================================================
// Outcome accounting
// =============================================================================

/// Counts of what one patrol pass did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatrolSummary {
    /// The pass did nothing (no clusters, or listing the super side failed)
    pub skipped: bool,
    /// Clusters listed successfully
    pub known_clusters: usize,
    /// Clusters excluded because listing failed
    pub unreachable_clusters: usize,
    /// Tenant objects put back on the event path
    pub requeued: u64,
    /// Orphaned projections deleted
    pub deleted_orphans: u64,
    /// Deletes skipped because the projection changed or vanished
    pub abstained: u64,
    /// Remediation calls that failed
    pub failed: u64,
}

impl PatrolSummary {
    /// Summary of a pass that did nothing
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Remediation counters shared by the handler callbacks of one pass
#[derive(Debug, Default)]
pub struct PatrolStats {
    requeued: AtomicU64,
    deleted_orphans: AtomicU64,
    abstained: AtomicU64,
    failed: AtomicU64,
}

impl PatrolStats {
    /// Fresh counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one remediation and export it as a metric
    pub fn record(&self, kind: &str, action: RemedyAction) {
        let counter = match action {
            RemedyAction::Requeue => &self.requeued,
            RemedyAction::DeleteOrphan => &self.deleted_orphans,
            RemedyAction::Abstain => &self.abstained,
            RemedyAction::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_remediation(kind, action);
    }

    /// Freeze the counters into a summary for a snapshot
    pub fn summary<K>(&self, snapshot: &PatrolSnapshot<K>) -> PatrolSummary {
        PatrolSummary {
            skipped: false,
            known_clusters: snapshot.known_clusters.len(),
            unreachable_clusters: snapshot.unreachable_clusters.len(),
            requeued: self.requeued.load(Ordering::Relaxed),
            deleted_orphans: self.deleted_orphans.load(Ordering::Relaxed),
            abstained: self.abstained.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Patroller
// =============================================================================

/// One kind's patrol pass
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PatrolDo: Send + Sync {
    /// Resource kind name, used in logs and metrics
    fn kind(&self) -> &'static str;

    /// True once the caches the pass reads from have synced
    fn has_synced(&self) -> bool;

    /// Run one full pass; failures are logged and counted, never returned
    async fn patroller_do(&self) -> PatrolSummary;
}

/// Timing of a [`Patroller`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatrolOptions {
    /// Interval between pass starts
    pub period: Duration,
    /// How long to wait for the cache sync gate
    pub sync_timeout: Duration,
    /// Interval between cache sync checks
    pub sync_poll_interval: Duration,
}

impl Default for PatrolOptions {
    fn default() -> Self {
        Self {
            period: DEFAULT_PATROL_PERIOD,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            sync_poll_interval: DEFAULT_SYNC_POLL_INTERVAL,
        }
    }
}

/// Runs a [`PatrolDo`] on a fixed period
pub struct Patroller {
    name: String,
    options: PatrolOptions,
    do_: Arc<dyn PatrolDo>,
}

impl Patroller {
    /// Create a patroller for one kind's pass
    pub fn new(do_: Arc<dyn PatrolDo>, options: PatrolOptions) -> Self {
        Self {
            name: format!("{}-patroller", do_.kind()),
            options,
            do_,
        }
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the cache sync gate, then run a pass every period until
    /// `cancel` fires.
    ///
    /// The first pass starts as soon as the caches are synced. A pass that has
    /// started runs to completion; cancellation is only observed between
    /// passes. Fails if the caches do not sync within the sync timeout.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        info!(patroller = %self.name, "starting patroller");

        if !self.wait_for_cache_sync(&cancel).await? {
            info!(patroller = %self.name, "cancelled before caches synced");
            return Ok(());
        }

        let mut ticker = tokio::time::interval(self.options.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }

        info!(patroller = %self.name, "shutting down patroller");
        Ok(())
    }

    /// Run a single pass and record its duration
    #[instrument(skip(self), fields(patroller = %self.name))]
    pub async fn run_once(&self) -> PatrolSummary {
        let timer = PatrolTimer::start(self.do_.kind());
        let summary = self.do_.patroller_do().await;
        timer.complete();

        if summary.skipped {
            debug!("patrol pass skipped");
        } else {
            info!(
                known_clusters = summary.known_clusters,
                unreachable_clusters = summary.unreachable_clusters,
                requeued = summary.requeued,
                deleted_orphans = summary.deleted_orphans,
                abstained = summary.abstained,
                failed = summary.failed,
                "patrol pass complete"
            );
        }
        summary
    }

    /// `Ok(true)` once synced, `Ok(false)` if cancelled first
    async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> Result<bool> {
        let start = Instant::now();
        loop {
            if self.do_.has_synced() {
                debug!(patroller = %self.name, "caches synced");
                return Ok(true);
            }
            if start.elapsed() > self.options.sync_timeout {
                return Err(Error::internal_with_context(
                    "patroller",
                    format!(
                        "{}: caches did not sync within {:?}",
                        self.name, self.options.sync_timeout
                    ),
                ));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.options.sync_poll_interval) => {}
            }
        }
    }
}
