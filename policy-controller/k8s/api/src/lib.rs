#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod policy;

pub use self::policy::{Binding, Definition};
pub use k8s_openapi::api::{
    self,
    admissionregistration::v1::{
        ParamKind, ValidatingAdmissionPolicy, ValidatingAdmissionPolicyBinding,
        ValidatingAdmissionPolicyBindingSpec, ValidatingAdmissionPolicySpec, Validation,
    },
};
pub use kube::{
    api::{Api, ObjectMeta},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::Discovery,
    runtime::watcher,
    Client, Error, Resource, ResourceExt,
};
