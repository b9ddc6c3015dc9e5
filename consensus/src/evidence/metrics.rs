use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
};

/// Reason evidence was not accepted by the pool.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Rejection {
    AlreadyPending,
    AlreadyCommitted,
    FutureHeight,
    Expired,
    Invalid,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectionLabel {
    pub reason: Rejection,
}

/// Metrics for the [super::Pool] and [super::Collector].
#[derive(Clone, Default)]
pub struct Metrics {
    /// Number of pending evidence items
    pub pending: Gauge,
    /// Number of evidence items committed
    pub committed: Counter,
    /// Number of pending evidence items pruned after expiring
    pub expired: Counter,
    /// Number of evidence items rejected by reason
    pub rejected: Family<RejectionLabel, Counter>,
    /// Number of faults reported to the collector
    pub faults: Counter,
    /// Number of faults materialized into evidence
    pub materialized: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init(context: &impl RuntimeMetrics) -> Self {
        let metrics = Self::default();
        context.register(
            "pending",
            "Number of pending evidence items",
            metrics.pending.clone(),
        );
        context.register(
            "committed",
            "Number of evidence items committed",
            metrics.committed.clone(),
        );
        context.register(
            "expired",
            "Number of pending evidence items pruned after expiring",
            metrics.expired.clone(),
        );
        context.register(
            "rejected",
            "Number of evidence items rejected by reason",
            metrics.rejected.clone(),
        );
        context.register(
            "faults",
            "Number of faults reported to the collector",
            metrics.faults.clone(),
        );
        context.register(
            "materialized",
            "Number of faults materialized into evidence",
            metrics.materialized.clone(),
        );
        metrics
    }

    pub(super) fn reject(&self, reason: Rejection) {
        self.rejected.get_or_create(&RejectionLabel { reason }).inc();
    }
}
