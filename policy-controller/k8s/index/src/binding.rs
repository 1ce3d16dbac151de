use crate::PolicyController;
use admission_policy_controller_core::{ResourceId, Validator};
use admission_policy_controller_k8s_api::{policy, Binding};
use std::sync::Arc;
use tracing::debug;

/// The last known state of a policy binding.
#[derive(Clone, Debug, Default)]
pub struct BindingRecord {
    pub last_value: Option<Arc<Binding>>,

    /// Compiled from the targeted definition on demand. Cleared whenever the
    /// binding or its definition changes.
    pub validator: Option<Arc<dyn Validator>>,
}

// === impl BindingRecord ===

impl BindingRecord {
    /// Identifies the definition targeted by the last known value.
    ///
    /// Definitions are cluster-scoped. A record without a value targets the
    /// empty identity.
    pub fn target(&self) -> ResourceId {
        self.last_value
            .as_deref()
            .map(target)
            .unwrap_or_default()
    }
}

fn target(binding: &Binding) -> ResourceId {
    ResourceId::cluster(policy::policy_name(binding))
}

// === impl PolicyController ===

impl PolicyController {
    /// Applies a binding update, or a deletion when `binding` is `None`.
    pub fn reconcile_binding(&self, id: &ResourceId, binding: Option<Arc<Binding>>) {
        let mut state = self.state.write();
        let state = &mut *state;
        state.cache = None;

        let record = state.bindings.entry(id.clone()).or_default();

        let old_target = record.target();
        let new_target = binding.as_deref().map(target).unwrap_or_default();

        // A deleted binding is removed from its definition even when the
        // target name is unchanged (i.e. empty), so that every indexed binding
        // has a record.
        if old_target != new_target || binding.is_none() {
            state.dependencies.remove(&old_target, id);
        }

        let Some(binding) = binding else {
            state.bindings.remove(id);
            debug!(%id, "Deleted binding");
            return;
        };

        state.dependencies.insert(new_target, id.clone());

        record.validator = None;
        record.last_value = Some(binding);
    }
}
