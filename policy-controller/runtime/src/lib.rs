#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use admission_policy_controller_core as core;
pub use admission_policy_controller_k8s_api as k8s;
pub use admission_policy_controller_k8s_index as index;

mod args;
mod compiler;
mod discovery;
mod params;

pub use self::{
    args::Args,
    compiler::{
        CompileError, CompiledPolicy, CompiledValidation, ExpressionCompiler, FailurePolicy,
    },
    discovery::DiscoveryResolver,
    params::KubeParamWatches,
};
