//! Point-in-time views of a store.
//!
//! A [`Snapshot`] owns a cloned [`StoreState`] behind its own store, so reads
//! that evaluate selectors never touch the source. Snapshots are reference
//! counted by hand: a new snapshot starts at one and schedules its own release
//! shortly after creation, so callers that want to keep it past the current
//! turn must [`retain`](Snapshot::retain) it.

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, MutexGuard};

use crate::batching::batch_updates;
use crate::config::RuntimeConfig;
use crate::evaluation::{initialize_node, peek_node_info, NodeInfo};
use crate::error::{invalid_usage, recoverable_violation, Error};
use crate::key::{next_store_id, NodeKey, StateId, StoreId};
use crate::loadable::{Loadable, Value};
use crate::node::{Readable, Trigger, Writable, WriteValue};
use crate::retention::{
    release_scheduled_retainables_now, update_retain_count, update_retain_count_to_zero,
    RetentionState, Retainable,
};
use crate::root::promise;
use crate::state::{clone_store_state, Cleanup, StoreState, TreeState};
use crate::store::{Store, StoreRef};
use crate::value_interface::{self, loadable_value};

/// How long a snapshot may be held across a suspension boundary.
pub const SUSPENSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Delay before a snapshot that was not retained releases itself.
pub const AUTO_RELEASE_DELAY: Duration = Duration::from_millis(10);

struct SnapshotStore {
    id: StoreId,
    parent: Option<StoreId>,
    config: RuntimeConfig,
    state: Mutex<StoreState>,
}

impl Store for SnapshotStore {
    fn store_id(&self) -> StoreId {
        self.id
    }

    fn parent_store_id(&self) -> Option<StoreId> {
        self.parent
    }

    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn get_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock()
    }

    fn replace_state(&self, replacer: &mut dyn FnMut(&Arc<TreeState>) -> Arc<TreeState>) {
        let tree = self.state.lock().current_tree.clone();
        let replaced = replacer(&tree);
        if !Arc::ptr_eq(&replaced, &tree) {
            self.state.lock().current_tree = replaced;
        }
    }
}

struct SnapshotInner {
    store: Arc<SnapshotStore>,
    ref_count: Mutex<usize>,
}

impl SnapshotInner {
    fn release_one(&self) {
        let released = {
            let mut count = self.ref_count.lock();
            if *count == 0 {
                false
            } else {
                *count -= 1;
                *count == 0
            }
        };
        if !released {
            return;
        }

        for cleanup in self.take_cleanups() {
            cleanup();
        }
        let store = &self.store;
        tracing::debug!(store = %store.id, "snapshot released");
        store.config.tracer().on_snapshot_released(store.id);

        if store.config.memory_management() {
            let retained: Vec<Retainable> = store
                .state
                .lock()
                .retention
                .reference_counts
                .keys()
                .cloned()
                .collect();
            for retainable in &retained {
                update_retain_count_to_zero(store.as_ref(), retainable);
            }
            let store_ref: StoreRef = store.clone();
            release_scheduled_retainables_now(&store_ref);
        }
    }

    fn take_cleanups(&self) -> Vec<Cleanup> {
        self.store
            .state
            .lock()
            .node_cleanup_functions
            .drain()
            .map(|(_, cleanup)| cleanup)
            .collect()
    }
}

impl Drop for SnapshotInner {
    fn drop(&mut self) {
        for cleanup in self.take_cleanups() {
            cleanup();
        }
    }
}

/// A read-only, reference-counted view of a store's state.
///
/// Cloning shares the reference count.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

/// Which nodes [`Snapshot::get_nodes`] lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFilter {
    /// Only nodes written (`Some(true)`) or not written (`Some(false)`) in the tree.
    pub is_modified: Option<bool>,
    /// Only nodes initialized (`Some(true)`) or not initialized (`Some(false)`).
    pub is_initialized: Option<bool>,
}

impl Snapshot {
    /// Empty snapshot, not derived from any store.
    pub fn fresh(config: RuntimeConfig) -> Self {
        let state = StoreState::new(config.map_kind());
        Self::from_state(config, state, None)
    }

    /// Fresh snapshot with `initialize` applied.
    pub fn fresh_with<F>(config: RuntimeConfig, initialize: F) -> Result<Self, Error>
    where
        F: FnOnce(&MutableSnapshot),
    {
        Self::fresh(config).map(initialize)
    }

    pub(crate) fn from_state(config: RuntimeConfig, state: StoreState, parent: Option<StoreId>) -> Self {
        let known_atoms: Vec<NodeKey> = state.known_atoms.iter().cloned().collect();
        let tree = state.current_tree.clone();
        let store = Arc::new(SnapshotStore {
            id: next_store_id(),
            parent,
            config,
            state: Mutex::new(state),
        });
        let store_ref: StoreRef = store.clone();
        let registry = store.config.registry();
        for key in known_atoms {
            if let Some(node) = registry.get_maybe(&key) {
                initialize_node(&store_ref, &tree, &node, Trigger::Get);
            }
            update_retain_count(store_ref.as_ref(), &Retainable::Node(key), 1);
        }

        let snapshot = Self {
            inner: Arc::new(SnapshotInner {
                store,
                ref_count: Mutex::new(1),
            }),
        };
        snapshot.auto_release();
        snapshot
    }

    fn auto_release(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.store.config.scheduler().schedule(
            AUTO_RELEASE_DELAY,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.release_one();
                }
            }),
        );
    }

    fn config(&self) -> &RuntimeConfig {
        &self.inner.store.config
    }

    fn store_ref(&self) -> StoreRef {
        self.inner.store.clone()
    }

    fn check_ref_count(&self) -> Result<(), Error> {
        if *self.inner.ref_count.lock() == 0 {
            invalid_usage(self.config(), Error::SnapshotReleased)?;
        }
        Ok(())
    }

    pub(crate) fn current_tree(&self) -> Result<Arc<TreeState>, Error> {
        self.check_ref_count()?;
        Ok(self.inner.store.state.lock().current_tree.clone())
    }

    // Move the whole state out, leaving an empty one behind.
    pub(crate) fn take_state(&self) -> (StoreState, Vec<Cleanup>) {
        let cleanups = self.inner.take_cleanups();
        let empty = StoreState::new(self.config().map_kind());
        let mut state = std::mem::replace(&mut *self.inner.store.state.lock(), empty);
        state.retention = RetentionState::default();
        (state, cleanups)
    }

    /// Keep the snapshot alive until the returned guard is dropped.
    ///
    /// Fails on a snapshot that was already released.
    pub fn retain(&self) -> Result<SnapshotRetainer, Error> {
        {
            let mut count = self.inner.ref_count.lock();
            if *count > 0 {
                *count += 1;
                return Ok(SnapshotRetainer {
                    inner: Some(self.inner.clone()),
                });
            }
        }
        let err = Error::RetainReleased;
        if !self.config().strict() {
            recoverable_violation(self.config(), err.clone());
        }
        Err(err)
    }

    /// Retain for `timeout`, e.g. while a consumer is suspended.
    pub fn retain_for(&self, timeout: Duration) -> Result<(), Error> {
        let retainer = self.retain()?;
        self.config()
            .scheduler()
            .schedule(timeout, Box::new(move || drop(retainer)));
        Ok(())
    }

    /// Returns true while the reference count is positive.
    pub fn is_retained(&self) -> bool {
        *self.inner.ref_count.lock() > 0
    }

    /// Id of the state this snapshot shows.
    pub fn get_id(&self) -> Result<StateId, Error> {
        Ok(self.current_tree()?.state_id)
    }

    /// Id of the snapshot's own store.
    pub fn get_store_id(&self) -> Result<StoreId, Error> {
        self.check_ref_count()?;
        Ok(self.inner.store.id)
    }

    /// Loadable of `node`.
    pub fn get_loadable<T>(&self, node: &impl Readable<T>) -> Result<Loadable, Error> {
        self.check_ref_count()?;
        self.config().registry().register(node.node());
        value_interface::get_loadable(&self.store_ref(), node.key())
    }

    /// Value of `node`; fails if it is loading or errored.
    pub fn get<T: Send + Sync + 'static>(&self, node: &impl Readable<T>) -> Result<Arc<T>, Error> {
        let loadable = self.get_loadable(node)?;
        loadable_value(node.key(), loadable)
    }

    /// Future of the settled value of `node`.
    pub fn get_promise<T: Send + Sync + 'static>(
        &self,
        node: &impl Readable<T>,
    ) -> BoxFuture<'static, Result<Arc<T>, Error>> {
        promise(node.key().clone(), self.get_loadable(node))
    }

    /// Keys of registered nodes matching `filter`, sorted.
    pub fn get_nodes(&self, filter: NodeFilter) -> Result<Vec<NodeKey>, Error> {
        self.check_ref_count()?;
        let state = self.inner.store.state.lock();
        let dirty = state.current_tree.dirty_atoms();
        let initialized =
            |key: &NodeKey| state.known_atoms.contains(key) || state.known_selectors.contains(key);
        let mut keys: Vec<NodeKey> = self
            .config()
            .registry()
            .keys()
            .into_iter()
            .chain(dirty.iter().cloned())
            .filter(|key| filter.is_initialized.map_or(true, |wanted| initialized(key) == wanted))
            .filter(|key| filter.is_modified.map_or(true, |wanted| dirty.contains(key) == wanted))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Debug information about `node`.
    pub fn get_info<T>(&self, node: &impl Readable<T>) -> Result<NodeInfo, Error> {
        let tree = self.current_tree()?;
        self.config().registry().register(node.node());
        peek_node_info(&self.store_ref(), &tree, node.key())
    }

    /// New snapshot with `mapper`'s writes applied. This snapshot is unchanged.
    pub fn map<F>(&self, mapper: F) -> Result<Snapshot, Error>
    where
        F: FnOnce(&MutableSnapshot),
    {
        self.check_ref_count()?;
        let mutable = MutableSnapshot::new(self, true);
        mapper(&mutable);
        Ok(mutable.into_snapshot())
    }

    /// Like [`map`](Snapshot::map) with an asynchronous mapper.
    ///
    /// The new snapshot is retained while the mapper runs.
    pub async fn async_map<F, Fut>(&self, mapper: F) -> Result<Snapshot, Error>
    where
        F: FnOnce(MutableSnapshot) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.check_ref_count()?;
        let mutable = MutableSnapshot::new(self, false);
        *mutable.inner.ref_count.lock() += 1;
        mapper(mutable.clone()).await;
        mutable.auto_release();
        Ok(mutable.into_snapshot())
    }

    pub(crate) fn downgrade(&self) -> WeakSnapshot {
        WeakSnapshot(Arc::downgrade(&self.inner))
    }

    /// Returns true if both handles refer to the same snapshot.
    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("store", &self.inner.store.id)
            .field("ref_count", &*self.inner.ref_count.lock())
            .finish()
    }
}

/// Handle that does not keep the snapshot's state alive.
#[derive(Clone)]
pub(crate) struct WeakSnapshot(Weak<SnapshotInner>);

impl WeakSnapshot {
    pub(crate) fn upgrade(&self) -> Option<Snapshot> {
        self.0.upgrade().map(|inner| Snapshot { inner })
    }
}

/// Keeps a snapshot alive; releases one count when dropped.
#[must_use = "dropping the retainer releases the snapshot"]
pub struct SnapshotRetainer {
    inner: Option<Arc<SnapshotInner>>,
}

impl SnapshotRetainer {
    /// Release now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SnapshotRetainer {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release_one();
        }
    }
}

impl fmt::Debug for SnapshotRetainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotRetainer").finish_non_exhaustive()
    }
}

/// A snapshot forked from another one that can be written to.
///
/// Writes go to the fork's own tree only.
#[derive(Clone)]
pub struct MutableSnapshot {
    snapshot: Snapshot,
    batched: bool,
}

impl Deref for MutableSnapshot {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl MutableSnapshot {
    fn new(parent: &Snapshot, batched: bool) -> Self {
        let parent_store = parent.store_ref();
        let tree = parent.inner.store.state.lock().current_tree.clone();
        let state = clone_store_state(parent_store.as_ref(), &tree, true);
        Self {
            snapshot: Snapshot::from_state(parent.config().clone(), state, Some(parent_store.store_id())),
            batched,
        }
    }

    fn write<T>(
        &self,
        node: &impl Readable<T>,
        op: impl FnOnce(&StoreRef, &NodeKey) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.check_ref_count()?;
        self.config().registry().register(node.node());
        let store = self.store_ref();
        let key = node.key().clone();
        let write = || {
            update_retain_count(store.as_ref(), &Retainable::Node(key.clone()), 1);
            op(&store, &key)
        };
        if self.batched {
            batch_updates(self.config(), write)?
        } else {
            write()
        }
    }

    /// Set `node` to `value`.
    pub fn set<T: Send + Sync + 'static>(&self, node: &impl Writable<T>, value: T) -> Result<(), Error> {
        self.write(node, |store, key| value_interface::set_value(store, key, value))
    }

    /// Set `node` to `update(current)`.
    pub fn update<T, F>(&self, node: &impl Writable<T>, update: F) -> Result<(), Error>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&T) -> T + Send + 'static,
    {
        self.write(node, |store, key| value_interface::update_value(store, key, update))
    }

    /// Reset `node` to its default.
    pub fn reset<T>(&self, node: &impl Writable<T>) -> Result<(), Error> {
        self.write(node, |store, key| {
            value_interface::set_loadable(store, key, WriteValue::Reset)
        })
    }

    /// Write a loadable, or reset, to `node`.
    pub fn set_loadable<T>(&self, node: &impl Writable<T>, value: WriteValue) -> Result<(), Error> {
        self.write(node, |store, key| value_interface::set_loadable(store, key, value))
    }

    /// Store raw values for atoms, validated on read.
    pub fn set_unvalidated_atom_values(
        &self,
        values: impl IntoIterator<Item = (NodeKey, Value)>,
    ) -> Result<(), Error> {
        self.check_ref_count()?;
        let store = self.store_ref();
        let write = || {
            values.into_iter().try_for_each(|(key, value)| {
                update_retain_count(store.as_ref(), &Retainable::Node(key.clone()), 1);
                value_interface::set_unvalidated_value(&store, &key, value)
            })
        };
        if self.batched {
            batch_updates(self.config(), write)?
        } else {
            write()
        }
    }

    /// The snapshot, with the writes made so far.
    pub fn into_snapshot(self) -> Snapshot {
        self.snapshot
    }
}

impl fmt::Debug for MutableSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MutableSnapshot").field(&self.snapshot).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskQueue;

    fn config_with_queue() -> (RuntimeConfig, Arc<TaskQueue>) {
        let queue = Arc::new(TaskQueue::new());
        let config = RuntimeConfig::builder()
            .strict(true)
            .scheduler(queue.clone())
            .build();
        (config, queue)
    }

    #[test]
    fn test_auto_release_after_delay() {
        let (config, queue) = config_with_queue();
        let snapshot = Snapshot::fresh(config);
        assert!(snapshot.is_retained());
        queue.advance(AUTO_RELEASE_DELAY);
        assert!(!snapshot.is_retained());
        assert!(matches!(snapshot.get_id(), Err(Error::SnapshotReleased)));
    }

    #[test]
    fn test_retainer_keeps_snapshot_alive() {
        let (config, queue) = config_with_queue();
        let snapshot = Snapshot::fresh(config);
        let retainer = snapshot.retain().unwrap();
        queue.run_until_idle();
        assert!(snapshot.is_retained());
        retainer.release();
        assert!(!snapshot.is_retained());
        assert!(matches!(snapshot.retain(), Err(Error::RetainReleased)));
    }

    #[test]
    fn test_retain_for_expires() {
        let (config, queue) = config_with_queue();
        let snapshot = Snapshot::fresh(config);
        snapshot.retain_for(SUSPENSE_TIMEOUT).unwrap();
        queue.advance(AUTO_RELEASE_DELAY);
        assert!(snapshot.is_retained());
        queue.advance(SUSPENSE_TIMEOUT);
        assert!(!snapshot.is_retained());
    }

    #[test]
    fn test_lenient_reads_after_release() {
        let queue = Arc::new(TaskQueue::new());
        let config = RuntimeConfig::builder()
            .strict(false)
            .scheduler(queue.clone())
            .build();
        let snapshot = Snapshot::fresh(config);
        queue.run_until_idle();
        assert!(snapshot.get_id().is_ok());
        assert!(snapshot.retain().is_err());
    }
}
