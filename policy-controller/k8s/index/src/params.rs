use crate::reconcile::{LoopHandle, Reconcile};
use admission_policy_controller_core::{ParamKindRef, ResourceId};
use admission_policy_controller_k8s_api::{ApiResource, DynamicObject};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::{convert::Infallible, sync::Arc};
use tokio_util::sync::CancellationToken;

/// A handle onto the cached parameter objects of a single parameter kind.
pub type ParamLoop = LoopHandle<DynamicObject>;

/// Starts a watch and reconcile loop over all objects of a parameter kind.
///
/// The loop must stop once `shutdown` is cancelled. Callers do not wait for it
/// to stop.
pub trait SpawnParamWatch: Send + Sync + 'static {
    fn spawn(
        &self,
        kind: &ParamKindRef,
        resource: &ApiResource,
        shutdown: CancellationToken,
    ) -> ParamLoop;
}

/// Reconciles parameter objects.
///
/// Parameters are not validated when they change; they're read from the
/// loop's cache when a policy is evaluated.
#[derive(Clone, Copy, Debug, Default)]
pub struct IgnoreParams;

/// Parameter kind watches, reference-counted by the definitions that declare
/// each kind.
///
/// A watch exists exactly as long as it has at least one dependent.
pub(crate) struct ParamWatches {
    root: CancellationToken,
    spawner: Arc<dyn SpawnParamWatch>,
    watches: HashMap<ParamKindRef, ParamWatch>,
}

struct ParamWatch {
    handle: ParamLoop,
    cancel: CancellationToken,
    dependents: HashSet<ResourceId>,
}

// === impl ParamWatches ===

impl ParamWatches {
    pub(crate) fn new(root: CancellationToken, spawner: Arc<dyn SpawnParamWatch>) -> Self {
        Self {
            root,
            spawner,
            watches: HashMap::default(),
        }
    }

    /// Registers `definition` as a dependent of `kind`, starting a watch if
    /// none is running.
    ///
    /// Returns true if a watch was started.
    pub(crate) fn acquire(
        &mut self,
        kind: &ParamKindRef,
        resource: &ApiResource,
        definition: &ResourceId,
    ) -> bool {
        if let Some(watch) = self.watches.get_mut(kind) {
            watch.dependents.insert(definition.clone());
            return false;
        }

        let cancel = self.root.child_token();
        let handle = self.spawner.spawn(kind, resource, cancel.clone());
        self.watches.insert(
            kind.clone(),
            ParamWatch {
                handle,
                cancel,
                dependents: Some(definition.clone()).into_iter().collect(),
            },
        );
        true
    }

    /// Removes `definition` as a dependent of `kind`, stopping the watch if it
    /// has no remaining dependents.
    ///
    /// Returns true if a watch was stopped.
    pub(crate) fn release(&mut self, kind: &ParamKindRef, definition: &ResourceId) -> bool {
        let Some(watch) = self.watches.get_mut(kind) else {
            return false;
        };
        watch.dependents.remove(definition);
        if !watch.dependents.is_empty() {
            return false;
        }

        if let Some(watch) = self.watches.remove(kind) {
            watch.cancel.cancel();
        }
        true
    }

    pub(crate) fn handle(&self, kind: &ParamKindRef) -> Option<&ParamLoop> {
        self.watches.get(kind).map(|watch| &watch.handle)
    }

    pub(crate) fn len(&self) -> usize {
        self.watches.len()
    }

    #[cfg(test)]
    pub(crate) fn dependents(&self, kind: &ParamKindRef) -> Option<&HashSet<ResourceId>> {
        self.watches.get(kind).map(|watch| &watch.dependents)
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&ParamKindRef, &HashSet<ResourceId>)> {
        self.watches
            .iter()
            .map(|(kind, watch)| (kind, &watch.dependents))
    }
}

// === impl IgnoreParams ===

impl Reconcile<DynamicObject> for IgnoreParams {
    type Error = Infallible;

    fn reconcile(
        &self,
        _id: &ResourceId,
        _value: Option<Arc<DynamicObject>>,
    ) -> Result<(), Infallible> {
        Ok(())
    }
}
