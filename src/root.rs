//! The live store.
//!
//! A [`Root`] owns a committed `current_tree`. Writes go to an in-flight
//! `next_tree`; a commit rotates `next` into `current`, keeps the old current
//! as `previous` while subscribers are notified, and then drops it.

use std::any::type_name;
use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, MutexGuard};

use crate::batching::batch_updates;
use crate::config::RuntimeConfig;
use crate::evaluation::{get_downstream_nodes, peek_node_info, NodeInfo};
use crate::error::{recoverable_violation, Error};
use crate::key::{next_store_id, NodeKey, StateId, StoreId};
use crate::loadable::{Loadable, Value};
use crate::node::{Readable, Writable, WriteValue};
use crate::retention::{release_scheduled_retainables_now, RetainGuard, Retainable};
use crate::snapshot::{MutableSnapshot, Snapshot};
use crate::snapshot_cache::{clone_snapshot, SnapshotVersion};
use crate::state::{Metadata, StoreState, TreeState};
use crate::store::{subscribe_to_transactions, NodeCallback, Store, StoreRef, Subscription, TransactionCallback};
use crate::value_interface::{self, loadable_value};

/// A live state container.
///
/// Cheap to clone; clones refer to the same store.
#[derive(Clone)]
pub struct Root {
    store: Arc<RootStore>,
}

struct RootStore {
    id: StoreId,
    config: RuntimeConfig,
    state: Mutex<StoreState>,
    me: Weak<RootStore>,
}

impl RootStore {
    fn store_ref(&self) -> Option<StoreRef> {
        self.me.upgrade().map(|store| store as StoreRef)
    }

    fn send_end_of_batch_notifications(&self, store: &StoreRef, tree: &Arc<TreeState>) {
        let dirty = tree.dirty_atoms();
        if dirty.is_empty() {
            return;
        }

        let node_transaction_callbacks: Vec<TransactionCallback> = {
            let state = self.state.lock();
            dirty
                .iter()
                .filter_map(|key| state.node_transaction_subscriptions.get(key))
                .flat_map(|subscriptions| subscriptions.iter().map(|(_, cb)| cb.clone()))
                .collect()
        };
        for callback in node_transaction_callbacks {
            callback(store);
        }

        let transaction_callbacks: Vec<TransactionCallback> = {
            let state = self.state.lock();
            state
                .transaction_subscriptions
                .iter()
                .map(|(_, cb)| cb.clone())
                .collect()
        };
        for callback in transaction_callbacks {
            callback(store);
        }

        let downstream = get_downstream_nodes(store, tree, &dirty);
        let node_callbacks: Vec<NodeCallback> = {
            let state = self.state.lock();
            downstream
                .iter()
                .filter_map(|key| state.node_subscriptions.get(key))
                .flat_map(|subscriptions| subscriptions.iter().map(|(_, cb)| cb.clone()))
                .collect()
        };
        for callback in node_callbacks {
            callback(tree);
        }
    }
}

impl Store for RootStore {
    fn store_id(&self) -> StoreId {
        self.id
    }

    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn get_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock()
    }

    fn replace_state(&self, replacer: &mut dyn FnMut(&Arc<TreeState>) -> Arc<TreeState>) {
        let (tree, fresh) = {
            let mut state = self.state.lock();
            let fresh = state.next_tree.is_none();
            (state.start_next_tree(), fresh)
        };
        let replaced = replacer(&tree);
        {
            let mut state = self.state.lock();
            if Arc::ptr_eq(&replaced, &tree) {
                let untouched = state
                    .next_tree
                    .as_ref()
                    .is_some_and(|next| Arc::ptr_eq(next, &tree));
                if fresh && untouched {
                    state.next_tree = None;
                    state.remove_graph(tree.version);
                }
                return;
            }
            state.next_tree = Some(replaced);
            if state.commit_depth > 0 {
                // The commit in progress picks the new tree up.
                return;
            }
        }
        let Some(store) = self.store_ref() else {
            return;
        };
        if !self.config.batch_stack().defer_commit(&store) {
            self.end_batch();
        }
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn add_transaction_metadata(&self, metadata: Metadata) -> Result<(), Error> {
        let next = self.state.lock().start_next_tree();
        next.add_metadata(metadata);
        Ok(())
    }

    fn end_batch(&self) {
        let Some(store) = self.store_ref() else {
            return;
        };
        loop {
            let (previous, current) = {
                let mut state = self.state.lock();
                let Some(next) = state.next_tree.take() else {
                    return;
                };
                let previous = std::mem::replace(&mut state.current_tree, next);
                state.previous_tree = Some(previous.clone());
                state.commit_depth += 1;
                (previous, state.current_tree.clone())
            };

            self.send_end_of_batch_notifications(&store, &current);

            let missing_previous = {
                let mut state = self.state.lock();
                let missing = match state.previous_tree.take() {
                    Some(previous) => {
                        state.remove_graph(previous.version);
                        false
                    }
                    None => true,
                };
                state.commit_depth -= 1;
                missing
            };
            if missing_previous {
                recoverable_violation(&self.config, Error::MissingPreviousTree);
            }
            self.config.snapshot_cache().invalidate();

            let dirty = current.dirty_count();
            tracing::debug!(
                store = %self.id,
                previous = %previous.version,
                current = %current.version,
                dirty,
                "committed"
            );
            self.config
                .tracer()
                .on_commit(self.id, previous.version, current.version, dirty);

            let idle = self.state.lock().next_tree.is_none();
            if idle {
                release_scheduled_retainables_now(&store);
            }
        }
    }
}

impl Default for Root {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Root {
    /// Create an empty store.
    pub fn new(config: RuntimeConfig) -> Self {
        let state = StoreState::new(config.map_kind());
        Self::from_state(config, state)
    }

    /// Create a store whose initial state is written by `initialize`.
    ///
    /// Atom effects of the atoms written there run again in the new store.
    pub fn with_initializer<F>(config: RuntimeConfig, initialize: F) -> Result<Self, Error>
    where
        F: FnOnce(&MutableSnapshot),
    {
        let snapshot = Snapshot::fresh(config.clone()).map(initialize)?;
        let (state, cleanups) = snapshot.take_state();
        for cleanup in cleanups {
            cleanup();
        }
        Ok(Self::from_state(config, state))
    }

    fn from_state(config: RuntimeConfig, state: StoreState) -> Self {
        let store = Arc::new_cyclic(|me| RootStore {
            id: next_store_id(),
            config,
            state: Mutex::new(state),
            me: me.clone(),
        });
        Self { store }
    }

    /// The configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.store.config
    }

    /// The underlying store.
    pub fn store(&self) -> StoreRef {
        self.store.clone()
    }

    /// Identity of the store.
    pub fn store_id(&self) -> StoreId {
        self.store.id
    }

    /// Identity of the committed state.
    pub fn state_id(&self) -> StateId {
        self.store.state.lock().current_tree.state_id
    }

    fn register<T>(&self, node: &impl Readable<T>) -> NodeKey {
        self.store.config.registry().register(node.node());
        node.key().clone()
    }

    /// Loadable of `node` in the committed state.
    pub fn get_loadable<T>(&self, node: &impl Readable<T>) -> Result<Loadable, Error> {
        let key = self.register(node);
        value_interface::get_loadable(&self.store(), &key)
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

    /// Debug information about `node` in the committed state.
    pub fn get_info<T>(&self, node: &impl Readable<T>) -> Result<NodeInfo, Error> {
        let key = self.register(node);
        let tree = self.store.state.lock().current_tree.clone();
        peek_node_info(&self.store(), &tree, &key)
    }

    /// Set `node` to `value`.
    pub fn set<T: Send + Sync + 'static>(&self, node: &impl Writable<T>, value: T) -> Result<(), Error> {
        let key = self.register(node);
        value_interface::set_value(&self.store(), &key, value)
    }

    /// Set `node` to `update(current)`.
    pub fn update<T, F>(&self, node: &impl Writable<T>, update: F) -> Result<(), Error>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&T) -> T + Send + 'static,
    {
        let key = self.register(node);
        value_interface::update_value(&self.store(), &key, update)
    }

    /// Reset `node` to its default.
    pub fn reset<T>(&self, node: &impl Writable<T>) -> Result<(), Error> {
        let key = self.register(node);
        value_interface::set_loadable(&self.store(), &key, WriteValue::Reset)
    }

    /// Write a loadable, or reset, to `node`.
    pub fn set_loadable<T>(&self, node: &impl Writable<T>, value: WriteValue) -> Result<(), Error> {
        let key = self.register(node);
        value_interface::set_loadable(&self.store(), &key, value)
    }

    /// Store raw values for atoms, validated on read. Applied as one batch.
    pub fn set_unvalidated_atom_values(
        &self,
        values: impl IntoIterator<Item = (NodeKey, Value)>,
    ) -> Result<(), Error> {
        let store = self.store();
        batch_updates(&self.store.config, || {
            values
                .into_iter()
                .try_for_each(|(key, value)| value_interface::set_unvalidated_value(&store, &key, value))
        })?
    }

    /// Notify subscribers of `node` without changing it.
    pub fn mark_modified<T>(&self, node: &impl Readable<T>) -> Result<(), Error> {
        let key = self.register(node);
        value_interface::mark_modified(&self.store(), &key)
    }

    /// Drop cached selector results of `node` and its upstream selectors.
    pub fn refresh<T>(&self, node: &impl Readable<T>) -> Result<(), Error> {
        let key = self.register(node);
        value_interface::refresh(&self.store(), &key)
    }

    /// Call `callback` after each commit that changed `node` or anything it
    /// depends on. Holding the subscription retains the node.
    pub fn subscribe<T, F>(&self, node: &impl Readable<T>, callback: F) -> Subscription
    where
        F: Fn(&Arc<TreeState>) + Send + Sync + 'static,
    {
        let key = self.register(node);
        value_interface::subscribe_to_node(&self.store(), &key, Arc::new(callback))
    }

    /// Call `callback` after every commit that changed something.
    pub fn subscribe_to_transactions<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StoreRef) + Send + Sync + 'static,
    {
        subscribe_to_transactions(&self.store(), Arc::new(callback), None)
    }

    /// Call `callback` after every commit that wrote `node`.
    pub fn subscribe_to_node_transactions<T, F>(&self, node: &impl Readable<T>, callback: F) -> Subscription
    where
        F: Fn(&StoreRef) + Send + Sync + 'static,
    {
        let key = self.register(node);
        subscribe_to_transactions(&self.store(), Arc::new(callback), Some(key))
    }

    /// Call `observer(snapshot, previous_snapshot)` after every commit.
    pub fn observe_transactions<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Snapshot, &Snapshot) + Send + Sync + 'static,
    {
        self.subscribe_to_transactions(move |store| {
            let snapshot = clone_snapshot(store, SnapshotVersion::Latest);
            let previous = clone_snapshot(store, SnapshotVersion::Previous);
            observer(&snapshot, &previous);
        })
    }

    /// Attach metadata to the in-flight commit.
    pub fn add_transaction_metadata(&self, metadata: Metadata) -> Result<(), Error> {
        self.store.add_transaction_metadata(metadata)
    }

    /// Run `callback` as one batch; see [`batch_updates`].
    pub fn batch<R>(&self, callback: impl FnOnce() -> R) -> Result<R, Error> {
        batch_updates(&self.store.config, callback)
    }

    /// Snapshot of the latest state, including an open batch's writes.
    pub fn snapshot(&self) -> Snapshot {
        clone_snapshot(&self.store(), SnapshotVersion::Latest)
    }

    /// Snapshot of the state before the commit in progress.
    ///
    /// Outside a commit this is the committed state.
    pub fn previous_snapshot(&self) -> Snapshot {
        clone_snapshot(&self.store(), SnapshotVersion::Previous)
    }

    /// Restore the atom values of `snapshot`.
    ///
    /// Atoms that opt out of snapshot restoration keep their value. The
    /// committed state takes over the snapshot's state id.
    pub fn goto_snapshot(&self, snapshot: &Snapshot) -> Result<(), Error> {
        let target = snapshot.current_tree()?;
        let store = self.store();
        let registry = self.store.config.registry();
        let latest = self.store.state.lock().latest_tree().clone();

        let mut keys = latest.atom_keys();
        keys.extend(target.atom_keys());
        keys.sort();
        keys.dedup();
        let changed: Vec<NodeKey> = keys
            .into_iter()
            .filter(|key| {
                let same = match (latest.atom_value(key), target.atom_value(key)) {
                    (Some(a), Some(b)) => a.is_same(&b),
                    (None, None) => true,
                    _ => false,
                };
                !same
                    && registry
                        .get_maybe(key)
                        .is_some_and(|node| node.should_restore_from_snapshots())
            })
            .collect();

        let state_id = target.state_id;
        batch_updates(&self.store.config, || {
            let mut result = Ok(());
            for key in &changed {
                let value = match target.atom_value(key) {
                    Some(loadable) => WriteValue::Set(loadable),
                    None => WriteValue::Reset,
                };
                if let Err(err) = value_interface::set_loadable(&store, key, value) {
                    result = result.and(Err(err));
                }
            }
            store.replace_state(&mut |tree: &Arc<TreeState>| {
                Arc::new(tree.with_ids(tree.version, state_id))
            });
            result
        })?
    }

    /// Hold a retain count on a node or zone until the guard is dropped.
    pub fn retain(&self, retainable: impl Into<Retainable>) -> RetainGuard {
        RetainGuard::new(&self.store(), retainable.into())
    }

    /// Release every scheduled node that nothing retains anymore.
    pub fn sweep(&self) {
        release_scheduled_retainables_now(&self.store());
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Root")
            .field("id", &self.store.id)
            .field("state", &*self.store.state.lock())
            .finish()
    }
}

pub(crate) fn promise<T: Send + Sync + 'static>(
    key: NodeKey,
    loadable: Result<Loadable, Error>,
) -> BoxFuture<'static, Result<Arc<T>, Error>> {
    async move {
        let value = loadable?
            .to_future()
            .await
            .map_err(|error| Error::Evaluation {
                key: key.clone(),
                error,
            })?;
        value.downcast::<T>().map_err(|_| Error::TypeMismatch {
            key,
            expected: type_name::<T>(),
        })
    }
    .boxed()
}
