//! Key-level read and write operations on a store.
//!
//! Writes are expressed as [`Action`]s. Inside a batch they are queued on the
//! batch stack and applied when the batch ends; otherwise they are applied to
//! the store right away. Applying a group of actions produces one new tree.

use std::any::type_name;
use std::sync::Arc;

use crate::evaluation::{get_downstream_nodes, get_node_loadable, set_node_value, EvalStack};
use crate::error::{recoverable_violation, Error};
use crate::graph::KeySet;
use crate::key::NodeKey;
use crate::loadable::{Loadable, Value};
use crate::node::{NodeKind, WriteValue};
use crate::retention::{update_retain_count, Retainable};
use crate::state::TreeState;
use crate::store::{NodeCallback, StoreRef, Subscription};

/// Computes a write from the current loadable of a node.
pub type Updater = Box<dyn FnOnce(&Loadable) -> Result<WriteValue, Error> + Send>;

pub(crate) enum ValueOrUpdater {
    Value(WriteValue),
    Updater(Updater),
}

/// A pending write to one store.
pub(crate) enum Action {
    Set { key: NodeKey, value: ValueOrUpdater },
    MarkModified { key: NodeKey },
    SetUnvalidated { key: NodeKey, value: Value },
}

/// Loadable of `key` in the store's committed tree.
pub fn get_loadable(store: &StoreRef, key: &NodeKey) -> Result<Loadable, Error> {
    let tree = store.get_state().current_tree.clone();
    get_loadable_in(store, key, &tree)
}

/// Loadable of `key` in `tree`, which must be one of the store's live trees.
pub fn get_loadable_in(store: &StoreRef, key: &NodeKey, tree: &Arc<TreeState>) -> Result<Loadable, Error> {
    let live = store.get_state().is_live_version(tree.version);
    if !live {
        recoverable_violation(store.config(), Error::DiscardedTree { version: tree.version });
    }
    Ok(get_node_loadable(store, tree, key, &EvalStack::new())?.settled())
}

/// Convert a loadable to a typed value.
pub fn loadable_value<T: Send + Sync + 'static>(key: &NodeKey, loadable: Loadable) -> Result<Arc<T>, Error> {
    match loadable {
        Loadable::Value(value) => value.downcast::<T>().map_err(|_| Error::TypeMismatch {
            key: key.clone(),
            expected: type_name::<T>(),
        }),
        Loadable::Error(error) => Err(Error::Evaluation {
            key: key.clone(),
            error,
        }),
        Loadable::Loading(_) => Err(Error::NotReady(key.clone())),
    }
}

/// Set `key` to `value`.
pub fn set_value<T: Send + Sync + 'static>(store: &StoreRef, key: &NodeKey, value: T) -> Result<(), Error> {
    set_loadable(store, key, WriteValue::value(value))
}

/// Write a loadable, or reset, to `key`.
pub fn set_loadable(store: &StoreRef, key: &NodeKey, value: WriteValue) -> Result<(), Error> {
    queue_or_perform(
        store,
        Action::Set {
            key: key.clone(),
            value: ValueOrUpdater::Value(value),
        },
    )
}

/// Set `key` to `update(current)`.
///
/// The updater sees the value as of the tree the write is applied to, which
/// inside a batch includes earlier writes of the same batch.
pub fn update_value<T, F>(store: &StoreRef, key: &NodeKey, update: F) -> Result<(), Error>
where
    T: Send + Sync + 'static,
    F: FnOnce(&T) -> T + Send + 'static,
{
    queue_or_perform(
        store,
        Action::Set {
            key: key.clone(),
            value: ValueOrUpdater::Updater(typed_updater(key.clone(), update)),
        },
    )
}

pub(crate) fn typed_updater<T, F>(key: NodeKey, update: F) -> Updater
where
    T: Send + Sync + 'static,
    F: FnOnce(&T) -> T + Send + 'static,
{
    Box::new(move |current: &Loadable| {
        let current = loadable_value::<T>(&key, current.clone())?;
        Ok(WriteValue::value(update(&current)))
    })
}

/// Mark `key` as modified without changing its value.
///
/// Subscribers of `key` and of everything downstream are notified on commit.
pub fn mark_modified(store: &StoreRef, key: &NodeKey) -> Result<(), Error> {
    queue_or_perform(store, Action::MarkModified { key: key.clone() })
}

/// Store a raw value for an atom, to be checked by its validator on read.
pub fn set_unvalidated_value(store: &StoreRef, key: &NodeKey, value: Value) -> Result<(), Error> {
    queue_or_perform(
        store,
        Action::SetUnvalidated {
            key: key.clone(),
            value,
        },
    )
}

/// Drop cached results of `key` and every selector upstream of it, then mark
/// it modified so it is read again.
pub fn refresh(store: &StoreRef, key: &NodeKey) -> Result<(), Error> {
    let tree = store.get_state().latest_tree().clone();
    let graph = store.get_graph(tree.version);
    let registry = store.config().registry();

    let mut visited = KeySet::default();
    let mut queue = vec![key.clone()];
    while let Some(key) = queue.pop() {
        if !visited.insert(key.clone()) {
            continue;
        }
        let Some(node) = registry.get_maybe(&key) else {
            continue;
        };
        node.clear_cache(store, &tree);
        if node.kind() == NodeKind::Selector {
            if let Some(deps) = graph.deps(&key) {
                queue.extend(deps.iter().cloned());
            }
        }
    }
    mark_modified(store, key)
}

/// Call `callback` after every commit that changed `key` or anything upstream.
///
/// The subscription also retains the node in the store.
pub fn subscribe_to_node(store: &StoreRef, key: &NodeKey, callback: NodeCallback) -> Subscription {
    let id = store
        .get_state()
        .node_subscriptions
        .entry(key.clone())
        .or_default()
        .insert(callback);
    let retainable = Retainable::Node(key.clone());
    update_retain_count(store.as_ref(), &retainable, 1);

    let weak = Arc::downgrade(store);
    let key = key.clone();
    Subscription::new(move || {
        let Some(store) = weak.upgrade() else {
            return;
        };
        {
            let mut state = store.get_state();
            if let Some(subscriptions) = state.node_subscriptions.get_mut(&key) {
                subscriptions.try_remove(id);
                if subscriptions.is_empty() {
                    state.node_subscriptions.remove(&key);
                }
            }
        }
        update_retain_count(store.as_ref(), &retainable, -1);
    })
}

fn queue_or_perform(store: &StoreRef, action: Action) -> Result<(), Error> {
    match store.config().batch_stack().queue(store, action) {
        None => Ok(()),
        Some(action) => apply_actions_to_store(store, vec![action]),
    }
}

/// Apply `actions` to the store's in-flight tree as one change.
///
/// Every action is attempted; the first failure is returned.
pub(crate) fn apply_actions_to_store(store: &StoreRef, actions: Vec<Action>) -> Result<(), Error> {
    let mut actions = Some(actions);
    let mut first_error = None;
    store.replace_state(&mut |tree: &Arc<TreeState>| {
        let Some(actions) = actions.take() else {
            return tree.clone();
        };
        let new_tree = Arc::new(tree.copy());
        let mut changed = false;
        for action in actions {
            match apply_action(store, &new_tree, action) {
                Ok(applied) => changed |= applied,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if !changed {
            return tree.clone();
        }
        invalidate_downstreams(store, &new_tree);
        store.config().snapshot_cache().invalidate();
        new_tree
    });
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn apply_action(store: &StoreRef, tree: &Arc<TreeState>, action: Action) -> Result<bool, Error> {
    match action {
        Action::Set { key, value } => {
            let value = match value {
                ValueOrUpdater::Value(value) => value,
                ValueOrUpdater::Updater(update) => {
                    let current = get_node_loadable(store, tree, &key, &EvalStack::new())?.settled();
                    if current.is_loading() {
                        recoverable_violation(store.config(), Error::NotReady(key.clone()));
                    }
                    update(&current)?
                }
            };
            let writes = set_node_value(store, tree, &key, value, &EvalStack::new())?;
            let changed = !writes.is_empty();
            for (key, value) in writes {
                write_loadable_to_tree(store, tree, key, value);
            }
            Ok(changed)
        }
        Action::MarkModified { key } => {
            tree.mark_dirty(key);
            Ok(true)
        }
        Action::SetUnvalidated { key, value } => {
            tree.delete_atom_value(&key);
            tree.set_non_validated(key.clone(), value);
            if let Some(node) = store.config().registry().get_maybe(&key) {
                node.invalidate(tree);
            }
            tree.mark_dirty(key);
            Ok(true)
        }
    }
}

fn write_loadable_to_tree(store: &StoreRef, tree: &TreeState, key: NodeKey, value: WriteValue) {
    match value {
        WriteValue::Set(loadable) => tree.set_atom_value(key.clone(), loadable),
        WriteValue::Reset => tree.delete_atom_value(&key),
    }
    tree.delete_non_validated(&key);
    if let Some(node) = store.config().registry().get_maybe(&key) {
        node.invalidate(tree);
    }
    tree.mark_dirty(key);
}

fn invalidate_downstreams(store: &StoreRef, tree: &TreeState) {
    let dirty = tree.dirty_atoms();
    if dirty.is_empty() {
        return;
    }
    let registry = store.config().registry();
    for key in get_downstream_nodes(store, tree, &dirty) {
        if let Some(node) = registry.get_maybe(&key) {
            node.invalidate(tree);
        }
    }
}
