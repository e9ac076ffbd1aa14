//! Metrics for syncer observability
//!
//! OpenTelemetry instruments for the two reconciliation paths:
//! - Patrol (remediations issued per pass, pass duration)
//! - Event path (reconcile outcomes per operation)
//!
//! Counts are informational; nothing in the engine reads them back.

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for syncer metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("syncer"));

// ============================================================================
// Patrol Metrics
// ============================================================================

/// Counter of remediations issued by the patrol
///
/// Labels:
/// - `kind`: resource kind (service, serviceaccount)
/// - `action`: requeue, delete_orphan, abstain, failed
pub static PATROL_REMEDIATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("syncer_patrol_remediations_total")
        .with_description("Total number of remediations issued by the patrol")
        .with_unit("{remediations}")
        .build()
});

/// Histogram of patrol pass duration
///
/// Labels:
/// - `kind`: resource kind
pub static PATROL_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("syncer_patrol_duration_seconds")
        .with_description("Duration of one patrol pass in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Event Path Metrics
// ============================================================================

/// Counter of downward-sync reconciles
///
/// Labels:
/// - `kind`: resource kind
/// - `operation`: create, update, delete, noop
/// - `result`: success, error
pub static RECONCILE_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("syncer_reconcile_total")
        .with_description("Total number of downward-sync reconciles")
        .with_unit("{reconciles}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// What the patrol did about one difference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemedyAction {
    /// Tenant object put back on the event path
    Requeue,
    /// Orphaned projection deleted
    DeleteOrphan,
    /// Delete skipped because the object changed or vanished underneath
    Abstain,
    /// Remediation call failed
    Failed,
}

impl RemedyAction {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requeue => "requeue",
            Self::DeleteOrphan => "delete_orphan",
            Self::Abstain => "abstain",
            Self::Failed => "failed",
        }
    }
}

/// Super-side operation chosen by a reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOperation {
    /// Projection created
    Create,
    /// Projection updated
    Update,
    /// Projection deleted
    Delete,
    /// Nothing to do
    Noop,
}

impl SyncOperation {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Noop => "noop",
        }
    }
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record one patrol remediation
pub fn record_remediation(kind: &str, action: RemedyAction) {
    PATROL_REMEDIATIONS.add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("action", action.as_str()),
        ],
    );
}

/// Record one reconcile outcome
pub fn record_reconcile(kind: &str, operation: SyncOperation, success: bool) {
    RECONCILE_TOTAL.add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("operation", operation.as_str()),
            KeyValue::new("result", if success { "success" } else { "error" }),
        ],
    );
}

/// Times one patrol pass
pub struct PatrolTimer {
    kind: String,
    start: Instant,
}

impl PatrolTimer {
    /// Start timing a pass for `kind`
    pub fn start(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            start: Instant::now(),
        }
    }

    /// Record the pass duration
    pub fn complete(self) {
        PATROL_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("kind", self.kind)],
        );
    }
}
