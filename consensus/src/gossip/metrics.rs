use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
};

/// Label for per-message-kind metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MessageLabel {
    /// Kind of message
    pub kind: String,
}

impl MessageLabel {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
        }
    }
}

/// Metrics for the [super::Handler].
#[derive(Clone, Default)]
pub struct Metrics {
    /// Number of messages received by kind
    pub received: Family<MessageLabel, Counter>,
    /// Number of messages rejected by kind
    pub rejected: Family<MessageLabel, Counter>,
    /// Number of conflicting votes observed
    pub conflicts: Counter,
    /// Number of two-thirds majorities reached
    pub majorities: Counter,
    /// Number of reconciliations completed
    pub reconciled: Counter,
    /// Number of reconciliations that timed out
    pub timeouts: Counter,
    /// Number of votes sent to peers during reconciliation
    pub votes_sent: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init(context: &impl RuntimeMetrics) -> Self {
        let metrics = Self::default();
        context.register(
            "received",
            "Number of messages received by kind",
            metrics.received.clone(),
        );
        context.register(
            "rejected",
            "Number of messages rejected by kind",
            metrics.rejected.clone(),
        );
        context.register(
            "conflicts",
            "Number of conflicting votes observed",
            metrics.conflicts.clone(),
        );
        context.register(
            "majorities",
            "Number of two-thirds majorities reached",
            metrics.majorities.clone(),
        );
        context.register(
            "reconciled",
            "Number of reconciliations completed",
            metrics.reconciled.clone(),
        );
        context.register(
            "timeouts",
            "Number of reconciliations that timed out",
            metrics.timeouts.clone(),
        );
        context.register(
            "votes_sent",
            "Number of votes sent to peers during reconciliation",
            metrics.votes_sent.clone(),
        );
        metrics
    }
}
