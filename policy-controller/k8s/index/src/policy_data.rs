use crate::{
    binding::BindingRecord, definition::DefinitionRecord, params::ParamLoop, PolicyController,
};
use admission_policy_controller_core::ResourceId;
use std::sync::Arc;

/// A definition with its bindings, as assembled for evaluation.
#[derive(Clone, Debug)]
pub struct PolicyData {
    pub id: ResourceId,
    pub definition: DefinitionRecord,

    /// The definition's parameter watch, if it declares a resolvable
    /// parameter kind.
    pub param_loop: Option<ParamLoop>,

    /// Bindings targeting the definition, ordered by identity. A binding
    /// without a validator belongs to a definition with a configuration error
    /// and can't be evaluated.
    pub bindings: Vec<BindingRecord>,
}

impl PolicyController {
    /// Returns the latest policy list, assembling it if anything has changed
    /// since it was last read.
    ///
    /// Assembling the list compiles a validator for every binding that lacks
    /// one, unless its definition has a configuration error.
    pub fn latest_policy_data(&self) -> Arc<[PolicyData]> {
        if let Some(policies) = self.state.read().cache.clone() {
            return policies;
        }

        // Concurrent readers may each rebuild the list; rebuilding from the
        // same state produces the same list.
        let mut state = self.state.write();
        let state = &mut *state;

        let mut policies = Vec::with_capacity(state.definitions.len());
        for (id, definition) in state.definitions.iter() {
            let mut bindings = Vec::new();
            for binding_id in state.dependencies.sorted_bindings(id) {
                let Some(binding) = state.bindings.get_mut(&binding_id) else {
                    continue;
                };

                if binding.validator.is_none() && definition.configuration_error.is_none() {
                    if let Some(value) = definition.last_value.as_deref() {
                        binding.validator = Some(self.compiler.compile(value));
                        self.metrics.observe_compilation();
                    }
                }
                bindings.push(binding.clone());
            }

            let param_loop = definition
                .param_kind()
                .and_then(|kind| state.params.handle(&kind).cloned());

            policies.push(PolicyData {
                id: id.clone(),
                definition: definition.clone(),
                param_loop,
                bindings,
            });
        }
        policies.sort_by(|a, b| a.id.cmp(&b.id));

        let policies = Arc::<[PolicyData]>::from(policies);
        state.cache = Some(policies.clone());
        policies
    }
}
