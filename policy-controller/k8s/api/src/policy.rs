use k8s_openapi::api::admissionregistration::v1::{
    ParamKind, ValidatingAdmissionPolicy, ValidatingAdmissionPolicyBinding,
};

/// A cluster-scoped policy definition.
pub type Definition = ValidatingAdmissionPolicy;

/// Binds a [`Definition`] to a scope of admission requests.
pub type Binding = ValidatingAdmissionPolicyBinding;

/// Returns the parameter kind declared by a definition, if any.
pub fn param_kind(definition: &Definition) -> Option<&ParamKind> {
    definition.spec.as_ref()?.param_kind.as_ref()
}

/// Returns the name of the definition a binding targets.
///
/// Bindings that omit `spec.policyName` target the empty name.
pub fn policy_name(binding: &Binding) -> &str {
    binding
        .spec
        .as_ref()
        .and_then(|spec| spec.policy_name.as_deref())
        .unwrap_or_default()
}
