//! The store contract shared by live roots and snapshots.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::MutexGuard;

use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::graph::Graph;
use crate::key::{NodeKey, StateId, StoreId};
use crate::state::{Metadata, StoreState, TreeState};

/// Shared handle to a store.
pub type StoreRef = Arc<dyn Store>;

/// Post-commit callback; receives the store that committed.
pub type TransactionCallback = Arc<dyn Fn(&StoreRef) + Send + Sync>;

/// Node change callback; receives the newly committed tree.
pub type NodeCallback = Arc<dyn Fn(&Arc<TreeState>) + Send + Sync>;

/// Owner of a [`StoreState`].
///
/// Implementations must never call back into user code while the guard from
/// [`get_state`](Store::get_state) is alive; callers must drop it before
/// evaluating nodes or running callbacks.
pub trait Store: Send + Sync + 'static {
    /// Identity of this store.
    fn store_id(&self) -> StoreId;

    /// Store this one was cloned from, if any.
    fn parent_store_id(&self) -> Option<StoreId> {
        None
    }

    /// Configuration the store was built with.
    fn config(&self) -> &RuntimeConfig;

    /// Lock the store state.
    fn get_state(&self) -> MutexGuard<'_, StoreState>;

    /// Replace the tree that writes go to.
    ///
    /// The replacer receives the tree and returns its successor; returning the
    /// same `Arc` means nothing changed.
    fn replace_state(&self, replacer: &mut dyn FnMut(&Arc<TreeState>) -> Arc<TreeState>);

    /// Copy of the graph for `version`, created empty on first access.
    ///
    /// Versions the store no longer tracks get an empty copy and nothing is
    /// stored for them.
    fn get_graph(&self, version: StateId) -> Graph {
        let mut state = self.get_state();
        if state.is_live_version(version) {
            state.graph_mut(version).clone()
        } else {
            state.graph(version)
        }
    }

    /// Whether transaction subscriptions are delivered.
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Attach metadata to the in-flight commit.
    fn add_transaction_metadata(&self, _metadata: Metadata) -> Result<(), Error> {
        Err(Error::UnsupportedOnSnapshot("add_transaction_metadata"))
    }

    /// Commit the in-flight tree, if the store commits at all.
    fn end_batch(&self) {}
}

/// Handle returned by subscriptions.
///
/// The subscription ends when the handle is released or dropped.
#[must_use = "dropping a subscription ends it"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A subscription that was never registered.
    pub fn inert() -> Self {
        Self { release: None }
    }

    /// End the subscription.
    pub fn release(self) {
        drop(self);
    }

    pub(crate) fn into_release(mut self) -> Box<dyn FnOnce() + Send> {
        self.release.take().unwrap_or_else(|| Box::new(|| {}))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// Register `callback` to run after each commit of `store`.
///
/// With `key` the callback only runs for commits that wrote that atom. On
/// stores that do not deliver transactions the returned handle is inert.
pub fn subscribe_to_transactions(
    store: &StoreRef,
    callback: TransactionCallback,
    key: Option<NodeKey>,
) -> Subscription {
    if !store.supports_transactions() {
        return Subscription::inert();
    }
    let weak: Weak<dyn Store> = Arc::downgrade(store);
    let mut state = store.get_state();
    match key {
        None => {
            let id = state.transaction_subscriptions.insert(callback);
            Subscription::new(move || {
                if let Some(store) = weak.upgrade() {
                    store.get_state().transaction_subscriptions.try_remove(id);
                }
            })
        }
        Some(key) => {
            let id = state
                .node_transaction_subscriptions
                .entry(key.clone())
                .or_default()
                .insert(callback);
            Subscription::new(move || {
                if let Some(store) = weak.upgrade() {
                    let mut state = store.get_state();
                    if let Some(subs) = state.node_transaction_subscriptions.get_mut(&key) {
                        subs.try_remove(id);
                        if subs.is_empty() {
                            state.node_transaction_subscriptions.remove(&key);
                        }
                    }
                }
            })
        }
    }
}
