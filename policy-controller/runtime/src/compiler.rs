use crate::{
    core::{Validator, ValidatorCompiler},
    k8s::{Definition, ResourceExt, Validation},
};
use std::{str::FromStr, sync::Arc};
use tracing::debug;

/// Gathers a definition's validations into a [`CompiledPolicy`].
///
/// Expressions are checked for presence only; they are evaluated by the
/// admission-time evaluator.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExpressionCompiler;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledPolicy {
    pub validations: Vec<CompiledValidation>,
    pub failure_policy: FailurePolicy,
    compile_errors: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledValidation {
    pub expression: String,
    pub message: Option<String>,
}

/// How an evaluator treats errors while applying a policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    Fail,
    Ignore,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("spec.validations[{index}].expression: Required value")]
    EmptyExpression { index: usize },

    #[error("spec.failurePolicy: Unsupported value: {0:?}")]
    UnsupportedFailurePolicy(String),
}

// === impl ExpressionCompiler ===

impl ValidatorCompiler for ExpressionCompiler {
    fn compile(&self, definition: &Definition) -> Arc<dyn Validator> {
        let policy = CompiledPolicy::new(definition);
        if !policy.compile_errors.is_empty() {
            debug!(
                definition = %definition.name_any(),
                errors = ?policy.compile_errors,
                "Compiled with errors"
            );
        }
        Arc::new(policy)
    }
}

// === impl CompiledPolicy ===

impl CompiledPolicy {
    fn new(definition: &Definition) -> Self {
        let mut compile_errors = Vec::new();
        let spec = definition.spec.as_ref();

        let failure_policy = match spec.and_then(|s| s.failure_policy.as_deref()) {
            None => FailurePolicy::default(),
            Some(policy) => policy.parse().unwrap_or_else(|error: CompileError| {
                compile_errors.push(error.to_string());
                FailurePolicy::default()
            }),
        };

        let validations = spec
            .and_then(|s| s.validations.as_deref())
            .unwrap_or_default()
            .iter()
            .enumerate()
            .filter_map(|(index, validation)| match compile_validation(validation) {
                Some(validation) => Some(validation),
                None => {
                    compile_errors.push(CompileError::EmptyExpression { index }.to_string());
                    None
                }
            })
            .collect();

        Self {
            validations,
            failure_policy,
            compile_errors,
        }
    }
}

fn compile_validation(validation: &Validation) -> Option<CompiledValidation> {
    let expression = validation.expression.trim();
    if expression.is_empty() {
        return None;
    }
    Some(CompiledValidation {
        expression: expression.to_string(),
        message: validation.message.clone(),
    })
}

impl Validator for CompiledPolicy {
    fn compile_errors(&self) -> &[String] {
        &self.compile_errors
    }
}

// === impl FailurePolicy ===

impl FromStr for FailurePolicy {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Fail" => Ok(Self::Fail),
            "Ignore" => Ok(Self::Ignore),
            s => Err(CompileError::UnsupportedFailurePolicy(s.to_string())),
        }
    }
}
