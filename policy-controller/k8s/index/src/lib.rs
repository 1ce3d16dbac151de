//! Admission Policy Controller
//!
//! The controller maintains the set of validating admission policies that an
//! admission-time evaluator applies. It watches the following cluster
//! resources:
//!
//! - Each `ValidatingAdmissionPolicy` (a *definition*) may declare a
//!   `paramKind`, naming a resource kind whose objects parameterize the
//!   policy. A watch is started for each distinct parameter kind and is shared
//!   by all definitions that declare it.
//! - Each `ValidatingAdmissionPolicyBinding` targets a single definition by
//!   name.
//!
//! ```text
//! [ Binding ] -> [ Definition ] -> [ paramKind watch ]
//! ```
//!
//! The evaluator reads the assembled policy list with
//! [`PolicyController::latest_policy_data`]. The list is cached; every
//! reconciled event clears the cache and the next read rebuilds it, compiling
//! a validator for each binding whose definition or target has changed.
//!
//! All state is guarded by a single lock, so the dependency index, the
//! per-resource records, and the parameter watches are always updated
//! together.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod binding;
mod controller;
mod definition;
mod dependencies;
mod metrics;
mod params;
mod policy_data;
pub mod reconcile;


pub use self::{
    binding::BindingRecord,
    controller::PolicyController,
    definition::{ConfigurationError, DefinitionRecord},
    metrics::ControllerMetrics,
    params::{IgnoreParams, ParamLoop, SpawnParamWatch},
    policy_data::PolicyData,
    reconcile::{LoopHandle, Reconcile, ReconcileLoop},
};
