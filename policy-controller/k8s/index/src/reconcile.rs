//! A single-worker reconcile loop over a stream of watch events.
//!
//! The loop keeps the latest value of each resource in a shared store and hands
//! each changed identity to a [`Reconcile`] implementation, one at a time. A
//! failed reconcile is retried with per-identity exponential backoff. Retries
//! read whatever value is current in the store when they fire.

use admission_policy_controller_core::ResourceId;
use admission_policy_controller_k8s_api::{watcher, Resource, ResourceExt};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::prelude::*;
use parking_lot::RwLock;
use std::{fmt, sync::Arc};
use tokio::{sync::watch, time};
use tokio_util::{
    sync::CancellationToken,
    time::{delay_queue, DelayQueue},
};
use tracing::{debug, info, trace, warn};

const BASE_RETRY_DELAY: time::Duration = time::Duration::from_millis(5);
const MAX_RETRY_DELAY: time::Duration = time::Duration::from_secs(1000);

/// Handles changes to a single resource identity.
///
/// `value` is `None` when the resource has been deleted.
pub trait Reconcile<K> {
    type Error: fmt::Display;

    fn reconcile(&self, id: &ResourceId, value: Option<Arc<K>>) -> Result<(), Self::Error>;
}

pub struct ReconcileLoop<K> {
    events: stream::BoxStream<'static, watcher::Event<K>>,
    store: Store<K>,
    synced: watch::Sender<bool>,
}

/// A read handle onto a [`ReconcileLoop`]'s store.
pub struct LoopHandle<K> {
    store: Store<K>,
    synced: watch::Receiver<bool>,
}

type Store<K> = Arc<RwLock<HashMap<ResourceId, Arc<K>>>>;

enum Work<K> {
    Event(Option<watcher::Event<K>>),
    Retry(ResourceId),
}

struct Retries {
    queue: DelayQueue<ResourceId>,
    scheduled: HashMap<ResourceId, delay_queue::Key>,
    failures: HashMap<ResourceId, u32>,
}

// === impl ReconcileLoop ===

impl<K> ReconcileLoop<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn new<S>(events: S) -> Self
    where
        S: Stream<Item = watcher::Event<K>> + Send + 'static,
    {
        let (synced, _) = watch::channel(false);
        Self {
            events: events.boxed(),
            store: Store::default(),
            synced,
        }
    }

    pub fn handle(&self) -> LoopHandle<K> {
        LoopHandle {
            store: self.store.clone(),
            synced: self.synced.subscribe(),
        }
    }

    /// Processes events until `shutdown` is cancelled.
    pub async fn run<R>(self, reconciler: Arc<R>, shutdown: CancellationToken)
    where
        R: Reconcile<K> + Send + Sync + 'static,
    {
        let Self {
            mut events,
            store,
            synced,
        } = self;
        let mut retries = Retries::default();

        // Identities observed since the most recent `Init`. When the list
        // completes, anything in the store that wasn't observed was deleted
        // while the watch was down.
        let mut listed: Option<HashSet<ResourceId>> = None;

        // Once the watch stream ends, pending retries are still processed
        // until shutdown.
        let mut watching = true;

        loop {
            let work = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Shutting down");
                    return;
                }

                Some(expired) = retries.queue.next(), if !retries.queue.is_empty() => {
                    Work::Retry(expired.into_inner())
                }

                event = events.next(), if watching => Work::Event(event),
            };

            let event = match work {
                Work::Retry(id) => {
                    retries.expired(&id);
                    trace!(%id, "Retrying");
                    process(&*reconciler, &store, &mut retries, id);
                    continue;
                }
                Work::Event(Some(event)) => event,
                Work::Event(None) => {
                    warn!("Watch stream terminated");
                    watching = false;
                    continue;
                }
            };

            match event {
                watcher::Event::Apply(resource) => {
                    let id = resource_id(&resource);
                    store.write().insert(id.clone(), Arc::new(resource));
                    process(&*reconciler, &store, &mut retries, id);
                }

                watcher::Event::Delete(resource) => {
                    let id = resource_id(&resource);
                    store.write().remove(&id);
                    process(&*reconciler, &store, &mut retries, id);
                }

                watcher::Event::Init => {
                    debug!("Listing resources");
                    listed = Some(HashSet::default());
                }

                watcher::Event::InitApply(resource) => {
                    let id = resource_id(&resource);
                    if let Some(listed) = listed.as_mut() {
                        listed.insert(id.clone());
                    }
                    store.write().insert(id.clone(), Arc::new(resource));
                    process(&*reconciler, &store, &mut retries, id);
                }

                watcher::Event::InitDone => {
                    if let Some(listed) = listed.take() {
                        let removed = {
                            let mut store = store.write();
                            let removed = store
                                .keys()
                                .filter(|id| !listed.contains(*id))
                                .cloned()
                                .collect::<Vec<_>>();
                            for id in &removed {
                                store.remove(id);
                            }
                            removed
                        };
                        for id in removed {
                            process(&*reconciler, &store, &mut retries, id);
                        }
                    }

                    if !synced.send_replace(true) {
                        info!(resources = store.read().len(), "Synced");
                    }
                }
            }
        }
    }
}

fn process<K, R>(reconciler: &R, store: &Store<K>, retries: &mut Retries, id: ResourceId)
where
    R: Reconcile<K>,
{
    let value = store.read().get(&id).cloned();
    match reconciler.reconcile(&id, value) {
        Ok(()) => retries.forget(&id),
        Err(error) => {
            let delay = retries.requeue(id.clone());
            info!(%id, %error, ?delay, "Reconcile failed; retrying");
        }
    }
}

fn resource_id<K: Resource>(resource: &K) -> ResourceId {
    ResourceId::new(resource.namespace().unwrap_or_default(), resource.name_any())
}

// === impl LoopHandle ===

impl<K> LoopHandle<K> {
    /// Indicates whether the loop has processed an initial listing.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Waits for the loop to process an initial listing.
    ///
    /// Returns early if the loop is dropped before syncing.
    pub async fn synced(&self) {
        let mut synced = self.synced.clone();
        let _ = synced.wait_for(|synced| *synced).await;
    }

    pub fn get(&self, id: &ResourceId) -> Option<Arc<K>> {
        self.store.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Returns true if both handles refer to the same loop.
    pub fn same_loop(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.store, &other.store)
    }
}

impl<K> Clone for LoopHandle<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K> fmt::Debug for LoopHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("synced", &self.has_synced())
            .field("resources", &self.len())
            .finish()
    }
}

// === impl Retries ===

impl Default for Retries {
    fn default() -> Self {
        Self {
            queue: DelayQueue::new(),
            scheduled: HashMap::default(),
            failures: HashMap::default(),
        }
    }
}

impl Retries {
    /// Schedules a retry, returning the delay before it fires.
    fn requeue(&mut self, id: ResourceId) -> time::Duration {
        let failures = self.failures.entry(id.clone()).or_default();
        let delay = backoff(*failures);
        *failures = failures.saturating_add(1);

        match self.scheduled.get(&id) {
            Some(key) => self.queue.reset(key, delay),
            None => {
                let key = self.queue.insert(id.clone(), delay);
                self.scheduled.insert(id, key);
            }
        }
        delay
    }

    fn forget(&mut self, id: &ResourceId) {
        self.failures.remove(id);
        if let Some(key) = self.scheduled.remove(id) {
            self.queue.remove(&key);
        }
    }

    fn expired(&mut self, id: &ResourceId) {
        self.scheduled.remove(id);
    }
}

fn backoff(failures: u32) -> time::Duration {
    BASE_RETRY_DELAY
        .saturating_mul(2u32.saturating_pow(failures))
        .min(MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use admission_policy_controller_k8s_api::{Definition, ObjectMeta};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    /// Records every reconcile and fails while `failing` holds the identity's
    /// name.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(ResourceId, bool)>>,
        failing: Mutex<HashSet<String>>,
    }

    impl Reconcile<Definition> for Recorder {
        type Error = String;

        fn reconcile(&self, id: &ResourceId, value: Option<Arc<Definition>>) -> Result<(), String> {
            self.calls.lock().push((id.clone(), value.is_some()));
            if self.failing.lock().contains(&id.name) {
                return Err(format!("{id} is failing"));
            }
            Ok(())
        }
    }

    impl Recorder {
        fn calls(&self) -> Vec<(ResourceId, bool)> {
            self.calls.lock().clone()
        }
    }

    fn mk_definition(name: &str) -> Definition {
        Definition {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn spawn_loop(
        reconciler: Arc<Recorder>,
    ) -> (
        mpsc::UnboundedSender<watcher::Event<Definition>>,
        LoopHandle<Definition>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reconcile = ReconcileLoop::new(UnboundedReceiverStream::new(rx));
        let handle = reconcile.handle();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reconcile.run(reconciler, shutdown.clone()));
        (tx, handle, shutdown, task)
    }

    async fn settle() {
        // Lets the loop drain its channel without advancing the paused clock
        // past any retry deadline.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        assert_eq!(backoff(0), time::Duration::from_millis(5));
        assert_eq!(backoff(1), time::Duration::from_millis(10));
        assert_eq!(backoff(4), time::Duration::from_millis(80));
        assert_eq!(backoff(30), MAX_RETRY_DELAY);
        assert_eq!(backoff(u32::MAX), MAX_RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn synced_after_initial_list() {
        let recorder = Arc::new(Recorder::default());
        let (tx, handle, shutdown, task) = spawn_loop(recorder.clone());

        tx.send(watcher::Event::Init).unwrap();
        tx.send(watcher::Event::InitApply(mk_definition("a"))).unwrap();
        settle().await;
        assert!(!handle.has_synced());

        tx.send(watcher::Event::InitDone).unwrap();
        time::timeout(time::Duration::from_secs(1), handle.synced())
            .await
            .expect("loop must sync");
        assert!(handle.has_synced());
        assert!(handle.get(&ResourceId::cluster("a")).is_some());
        assert_eq!(recorder.calls(), vec![(ResourceId::cluster("a"), true)]);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn relist_deletes_missing_resources() {
        let recorder = Arc::new(Recorder::default());
        let (tx, handle, shutdown, task) = spawn_loop(recorder.clone());

        tx.send(watcher::Event::Apply(mk_definition("a"))).unwrap();
        tx.send(watcher::Event::Apply(mk_definition("b"))).unwrap();
        tx.send(watcher::Event::Init).unwrap();
        tx.send(watcher::Event::InitApply(mk_definition("a"))).unwrap();
        tx.send(watcher::Event::InitDone).unwrap();
        settle().await;

        assert_eq!(handle.len(), 1);
        assert!(!handle.is_empty());
        assert!(handle.get(&ResourceId::cluster("b")).is_none());
        let names = handle
            .list()
            .iter()
            .map(|definition| definition.name_any())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a"]);
        assert_eq!(
            recorder.calls(),
            vec![
                (ResourceId::cluster("a"), true),
                (ResourceId::cluster("b"), true),
                (ResourceId::cluster("a"), true),
                (ResourceId::cluster("b"), false),
            ]
        );

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retries_failures_with_backoff() {
        let recorder = Arc::new(Recorder::default());
        recorder.failing.lock().insert("a".to_string());
        let (tx, _handle, shutdown, task) = spawn_loop(recorder.clone());

        tx.send(watcher::Event::Apply(mk_definition("a"))).unwrap();
        settle().await;
        assert_eq!(recorder.calls().len(), 1);

        // The first retry fires after the base delay.
        time::sleep(time::Duration::from_millis(6)).await;
        settle().await;
        assert_eq!(recorder.calls().len(), 2);

        // The second retry waits twice as long.
        time::sleep(time::Duration::from_millis(6)).await;
        settle().await;
        assert_eq!(recorder.calls().len(), 2);
        time::sleep(time::Duration::from_millis(5)).await;
        settle().await;
        assert_eq!(recorder.calls().len(), 3);

        // Once the reconcile succeeds, no further retries are scheduled.
        recorder.failing.lock().clear();
        time::sleep(time::Duration::from_millis(21)).await;
        settle().await;
        assert_eq!(recorder.calls().len(), 4);
        time::sleep(time::Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(recorder.calls().len(), 4);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_reads_latest_value() {
        let recorder = Arc::new(Recorder::default());
        recorder.failing.lock().insert("a".to_string());
        let (tx, _handle, shutdown, task) = spawn_loop(recorder.clone());

        tx.send(watcher::Event::Apply(mk_definition("a"))).unwrap();
        settle().await;
        tx.send(watcher::Event::Delete(mk_definition("a"))).unwrap();
        settle().await;
        recorder.failing.lock().clear();

        time::sleep(MAX_RETRY_DELAY).await;
        settle().await;
        let calls = recorder.calls();
        assert_eq!(calls[0], (ResourceId::cluster("a"), true));
        assert!(calls[1..]
            .iter()
            .all(|call| *call == (ResourceId::cluster("a"), false)));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retries_after_stream_ends() {
        let recorder = Arc::new(Recorder::default());
        recorder.failing.lock().insert("a".to_string());
        let (tx, handle, shutdown, task) = spawn_loop(recorder.clone());

        tx.send(watcher::Event::Apply(mk_definition("a"))).unwrap();
        drop(tx);
        settle().await;
        assert_eq!(recorder.calls().len(), 1);

        recorder.failing.lock().clear();
        time::sleep(time::Duration::from_millis(6)).await;
        settle().await;
        assert_eq!(
            recorder.calls(),
            vec![
                (ResourceId::cluster("a"), true),
                (ResourceId::cluster("a"), true),
            ]
        );
        assert!(handle.get(&ResourceId::cluster("a")).is_some());
        assert!(!task.is_finished());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let (_tx, _handle, shutdown, task) = spawn_loop(recorder);
        shutdown.cancel();
        time::timeout(time::Duration::from_secs(1), task)
            .await
            .expect("loop must stop")
            .unwrap();
    }
}
