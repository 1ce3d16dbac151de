#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod compile;
mod param_kind;
mod resolve;
mod resource_id;

pub use self::{
    compile::{Validator, ValidatorCompiler},
    param_kind::{GroupVersion, ParamKindRef, ParseGroupVersionError},
    resolve::{ResolveError, ResolveParamKind},
    resource_id::ResourceId,
};
