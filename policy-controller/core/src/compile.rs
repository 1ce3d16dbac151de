use admission_policy_controller_k8s_api::Definition;
use std::{fmt, sync::Arc};

/// A definition compiled into a form that can be evaluated against admission
/// requests.
pub trait Validator: fmt::Debug + Send + Sync + 'static {
    /// Describes problems found while compiling the definition.
    ///
    /// A validator with compile errors is still usable; how such errors are
    /// enforced is up to the evaluator.
    fn compile_errors(&self) -> &[String];
}

/// Compiles definitions into validators.
///
/// Compilation is expected to be synchronous and free of side effects: it may
/// be invoked while the controller holds its exclusive lock.
pub trait ValidatorCompiler: Send + Sync + 'static {
    fn compile(&self, definition: &Definition) -> Arc<dyn Validator>;
}
