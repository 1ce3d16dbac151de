use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    definitions: Family<DefinitionLabels, Counter>,
    reconciles: Family<ReconcileLabels, Counter>,
    param_watches: Gauge,
    compilations: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DefinitionLabels {
    state: &'static str,
    enforcement_action: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReconcileLabels {
    kind: &'static str,
    result: &'static str,
}

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let definitions = Family::default();
        prom.register(
            "definitions",
            "Count of policy definition lifecycle transitions",
            definitions.clone(),
        );

        let reconciles = Family::default();
        prom.register(
            "reconciles",
            "Count of reconciled policy definition and binding events",
            reconciles.clone(),
        );

        let param_watches = Gauge::default();
        prom.register(
            "param_watches",
            "Gauge of the number of running parameter kind watches",
            param_watches.clone(),
        );

        let compilations = Counter::default();
        prom.register(
            "compilations",
            "Count of validators compiled from policy definitions",
            compilations.clone(),
        );

        Self {
            definitions,
            reconciles,
            param_watches,
            compilations,
        }
    }

    // Only `deny` is supported as an enforcement action.
    pub(crate) fn observe_definition(&self, state: &'static str) {
        self.definitions
            .get_or_create(&DefinitionLabels {
                state,
                enforcement_action: "deny",
            })
            .inc();
    }

    pub(crate) fn observe_reconcile(&self, kind: &'static str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.reconciles
            .get_or_create(&ReconcileLabels { kind, result })
            .inc();
    }

    pub(crate) fn set_param_watches(&self, count: usize) {
        self.param_watches.set(count as i64);
    }

    pub(crate) fn observe_compilation(&self) {
        self.compilations.inc();
    }
}
