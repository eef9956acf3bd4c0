use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Instruments reconciliation passes.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    passes: Counter,
    interrupted: Counter,
    mutations: Family<OpLabels, Counter>,
    failures: Counter,
    conflicts: Counter,
    failing_bindings: Gauge,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct OpLabels {
    op: &'static str,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();

        reg.register(
            "reconcile_passes",
            "Count of reconciliation passes",
            metrics.passes.clone(),
        );
        reg.register(
            "reconcile_interrupted",
            "Count of reconciliation passes interrupted by shutdown",
            metrics.interrupted.clone(),
        );
        reg.register(
            "rule_mutations",
            "Count of rules inserted into or deleted from the packet filter",
            metrics.mutations.clone(),
        );
        reg.register(
            "binding_failures",
            "Count of service bindings that failed to reconcile",
            metrics.failures.clone(),
        );
        reg.register(
            "rule_conflicts",
            "Count of installed rules replaced by a different rule for the same match",
            metrics.conflicts.clone(),
        );
        reg.register(
            "failing_bindings",
            "The number of service bindings that failed to reconcile in the last pass",
            metrics.failing_bindings.clone(),
        );

        metrics
    }

    pub(crate) fn pass(&self, failing: usize, interrupted: bool) {
        self.passes.inc();
        if interrupted {
            self.interrupted.inc();
        }
        self.failing_bindings.set(failing as i64);
    }

    pub(crate) fn inserted(&self) {
        self.mutations.get_or_create(&OpLabels { op: "insert" }).inc();
    }

    pub(crate) fn deleted(&self) {
        self.mutations.get_or_create(&OpLabels { op: "delete" }).inc();
    }

    pub(crate) fn failure(&self) {
        self.failures.inc();
    }

    pub(crate) fn conflict(&self) {
        self.conflicts.inc();
    }
}
