use crate::{
    binding::BindingRecord,
    definition::{ConfigurationError, DefinitionRecord},
    dependencies::DependencyIndex,
    metrics::ControllerMetrics,
    params::{ParamWatches, SpawnParamWatch},
    policy_data::PolicyData,
    reconcile::{LoopHandle, Reconcile, ReconcileLoop},
};
use admission_policy_controller_core::{ResolveParamKind, ResourceId, ValidatorCompiler};
use admission_policy_controller_k8s_api::{watcher, Binding, Definition};
use ahash::AHashMap as HashMap;
use futures::prelude::*;
use parking_lot::{Mutex, RwLock};
use std::{convert::Infallible, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Tracks policy definitions, the bindings that reference them, and the
/// parameter kinds they declare, and serves the assembled policy list.
pub struct PolicyController {
    /// Guards all indexing state. Every reconcile takes it exclusively; reads
    /// of an already-assembled policy list only take it shared.
    pub(crate) state: RwLock<State>,

    lifecycle: Mutex<Lifecycle>,

    /// Parent of every loop the controller runs, including parameter watches.
    shutdown: CancellationToken,

    pub(crate) compiler: Arc<dyn ValidatorCompiler>,
    pub(crate) resolver: Arc<dyn ResolveParamKind>,
    pub(crate) metrics: ControllerMetrics,

    definitions: LoopHandle<Definition>,
    bindings: LoopHandle<Binding>,
}

pub(crate) struct State {
    /// The assembled policy list. Cleared by every reconcile and rebuilt on the
    /// next read.
    pub(crate) cache: Option<Arc<[PolicyData]>>,

    pub(crate) definitions: HashMap<ResourceId, DefinitionRecord>,
    pub(crate) bindings: HashMap<ResourceId, BindingRecord>,
    pub(crate) dependencies: DependencyIndex,
    pub(crate) params: ParamWatches,
}

enum Lifecycle {
    NotStarted {
        definitions: ReconcileLoop<Definition>,
        bindings: ReconcileLoop<Binding>,
    },
    Running,
    Stopped,
}

// === impl PolicyController ===

impl PolicyController {
    pub fn new<D, B>(
        definitions: D,
        bindings: B,
        compiler: Arc<dyn ValidatorCompiler>,
        resolver: Arc<dyn ResolveParamKind>,
        param_watches: Arc<dyn SpawnParamWatch>,
        metrics: ControllerMetrics,
    ) -> Arc<Self>
    where
        D: Stream<Item = watcher::Event<Definition>> + Send + 'static,
        B: Stream<Item = watcher::Event<Binding>> + Send + 'static,
    {
        let definitions = ReconcileLoop::new(definitions);
        let bindings = ReconcileLoop::new(bindings);
        let shutdown = CancellationToken::new();

        Arc::new(Self {
            state: RwLock::new(State {
                cache: None,
                definitions: HashMap::default(),
                bindings: HashMap::default(),
                dependencies: DependencyIndex::default(),
                params: ParamWatches::new(shutdown.clone(), param_watches),
            }),
            definitions: definitions.handle(),
            bindings: bindings.handle(),
            lifecycle: Mutex::new(Lifecycle::NotStarted {
                definitions,
                bindings,
            }),
            shutdown,
            compiler,
            resolver,
            metrics,
        })
    }

    /// Runs the definition and binding reconcile loops until `shutdown` is
    /// cancelled.
    ///
    /// Parameter watches are cancelled on shutdown but are not waited on. The
    /// controller may only be run once; subsequent calls return immediately.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let (definitions, bindings) = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Running) {
                Lifecycle::NotStarted {
                    definitions,
                    bindings,
                } => (definitions, bindings),
                prior => {
                    *lifecycle = prior;
                    debug!("Policy controller already started");
                    return;
                }
            }
        };

        // Tears down every loop, including parameter watches, if this future
        // is dropped before `shutdown` fires.
        let _teardown = self.shutdown.clone().drop_guard();

        info!("Starting policy controller");
        let definitions = tokio::spawn(
            definitions
                .run(self.clone(), self.shutdown.clone())
                .instrument(info_span!("definitions")),
        );
        let bindings = tokio::spawn(
            bindings
                .run(self.clone(), self.shutdown.clone())
                .instrument(info_span!("bindings")),
        );

        shutdown.cancelled().await;
        self.shutdown.cancel();

        for (name, task) in [("definitions", definitions), ("bindings", bindings)] {
            if let Err(error) = task.await {
                warn!(controller = name, %error, "Reconcile loop failed");
            }
        }

        *self.lifecycle.lock() = Lifecycle::Stopped;
        info!("Policy controller stopped");
    }

    /// Indicates whether both definitions and bindings have been listed.
    pub fn has_synced(&self) -> bool {
        self.definitions.has_synced() && self.bindings.has_synced()
    }

    /// Waits for both definitions and bindings to be listed.
    pub async fn synced(&self) {
        tokio::join!(self.definitions.synced(), self.bindings.synced());
    }

    /// Returns true once `run` has returned.
    pub fn is_stopped(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Stopped)
    }
}

impl Reconcile<Definition> for PolicyController {
    type Error = ConfigurationError;

    fn reconcile(
        &self,
        id: &ResourceId,
        definition: Option<Arc<Definition>>,
    ) -> Result<(), ConfigurationError> {
        let res = self.reconcile_definition(id, definition);
        self.metrics.observe_reconcile("definition", res.is_ok());
        res
    }
}

impl Reconcile<Binding> for PolicyController {
    type Error = Infallible;

    fn reconcile(&self, id: &ResourceId, binding: Option<Arc<Binding>>) -> Result<(), Infallible> {
        self.reconcile_binding(id, binding);
        self.metrics.observe_reconcile("binding", true);
        Ok(())
    }
}
