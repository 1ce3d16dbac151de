use crate::PolicyController;
use admission_policy_controller_core::{
    ParamKindRef, ParseGroupVersionError, ResolveError, ResourceId,
};
use admission_policy_controller_k8s_api::{policy, Definition};
use std::{collections::hash_map::Entry, sync::Arc};
use tracing::{debug, info};

/// The last known state of a policy definition.
#[derive(Clone, Debug, Default)]
pub struct DefinitionRecord {
    pub last_value: Option<Arc<Definition>>,

    /// Set when the definition's parameter kind can't be resolved. Bindings of
    /// a definition with a configuration error are never compiled.
    pub configuration_error: Option<ConfigurationError>,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The parameter kind's API version is malformed. This can't be fixed by
    /// retrying.
    #[error("failed to parse apiVersion of paramKind '{kind}' with error: {source}")]
    InvalidParamKind {
        kind: ParamKindRef,
        #[source]
        source: ParseGroupVersionError,
    },

    /// The parameter kind could not be resolved to a resource. The kind may be
    /// registered later.
    #[error("failed to find resource referenced by paramKind: '{kind}'")]
    ParamKindNotFound {
        kind: ParamKindRef,
        #[source]
        source: ResolveError,
    },
}

// === impl DefinitionRecord ===

impl DefinitionRecord {
    pub fn param_kind(&self) -> Option<ParamKindRef> {
        self.last_value
            .as_deref()
            .and_then(policy::param_kind)
            .map(ParamKindRef::from)
    }
}

// === impl ConfigurationError ===

impl ConfigurationError {
    /// Indicates that the error can only be resolved by changing the
    /// definition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidParamKind { .. })
    }
}

// === impl PolicyController ===

impl PolicyController {
    /// Applies a definition update, or a deletion when `definition` is `None`.
    ///
    /// An error indicates that the definition's parameter kind could not be
    /// resolved and the update should be retried. The error is also recorded
    /// on the definition.
    pub fn reconcile_definition(
        &self,
        id: &ResourceId,
        definition: Option<Arc<Definition>>,
    ) -> Result<(), ConfigurationError> {
        let mut state = self.state.write();
        let state = &mut *state;
        state.cache = None;

        let record = match state.definitions.entry(id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.metrics.observe_definition("active");
                entry.insert(DefinitionRecord::default())
            }
        };

        let param_kind = definition
            .as_deref()
            .and_then(policy::param_kind)
            .map(ParamKindRef::from);

        // Stop depending on the old parameter kind if it was removed or
        // changed. The watch stops with its last dependent.
        if let Some(old) = record.param_kind() {
            if param_kind.as_ref() != Some(&old) && state.params.release(&old, id) {
                debug!(%id, kind = %old, "Stopped parameter watch");
                self.metrics.set_param_watches(state.params.len());
            }
        }

        // Any change to the definition invalidates its bindings' validators.
        for binding in state.dependencies.bindings(id) {
            if let Some(binding) = state.bindings.get_mut(binding) {
                binding.validator = None;
            }
        }

        let Some(definition) = definition else {
            state.definitions.remove(id);
            debug!(%id, "Deleted definition");
            return Ok(());
        };

        record.last_value = Some(definition);
        record.configuration_error = None;

        let Some(param_kind) = param_kind else {
            return Ok(());
        };

        let gvk = match param_kind.group_version_kind() {
            Ok(gvk) => gvk,
            Err(source) => {
                let error = ConfigurationError::InvalidParamKind {
                    kind: param_kind,
                    source,
                };
                info!(%id, %error, "Invalid definition");
                record.configuration_error = Some(error);
                return Ok(());
            }
        };

        let resource = match self.resolver.resolve(&gvk) {
            Ok(resource) => resource,
            Err(source) => {
                let error = ConfigurationError::ParamKindNotFound {
                    kind: param_kind,
                    source,
                };
                record.configuration_error = Some(error.clone());
                return Err(error);
            }
        };

        if state.params.acquire(&param_kind, &resource, id) {
            debug!(%id, kind = %param_kind, "Started parameter watch");
            self.metrics.set_param_watches(state.params.len());
        }

        Ok(())
    }
}
