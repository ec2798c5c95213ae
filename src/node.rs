//! Node definitions and the registry that maps keys to them.
//!
//! A node is anything with a key that a store can read: atoms and selectors.
//! The store side only ever talks to the object-safe [`Node`] trait; the typed
//! handles ([`Atom`](crate::Atom), [`Selector`](crate::Selector)) implement
//! [`Readable`] / [`Writable`] so user code keeps its types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ahash::RandomState;
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::evaluation::EvalStack;
use crate::error::Error;
use crate::key::NodeKey;
use crate::loadable::{Loadable, Value};
use crate::retention::RetentionZone;
use crate::state::{Cleanup, TreeState};
use crate::store::StoreRef;

/// Kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeKind {
    /// Leaf state cell.
    Atom,
    /// Derived node.
    Selector,
}

/// A write to one node.
#[derive(Debug, Clone)]
pub enum WriteValue {
    /// Store this loadable.
    Set(Loadable),
    /// Revert to the default value.
    Reset,
}

impl WriteValue {
    /// Write a concrete value.
    pub fn value<T: Send + Sync + 'static>(value: T) -> Self {
        WriteValue::Set(Loadable::with_value(value))
    }

    /// Returns true for [`WriteValue::Reset`].
    pub fn is_reset(&self) -> bool {
        matches!(self, WriteValue::Reset)
    }
}

/// Writes produced by setting one node, keyed by the nodes actually written.
pub type WriteSet = IndexMap<NodeKey, WriteValue, RandomState>;

/// What keeps a node alive in a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum RetainedBy {
    /// Lives as long as the store.
    #[default]
    Root,
    /// Lives while something holds a retain count on it.
    Components,
    /// Lives while any of the zones is retained.
    Zones(Vec<RetentionZone>),
}

/// Persistence tag of an atom, consumed by persistence adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PersistenceType {
    /// Not persisted.
    #[default]
    None,
    /// Persisted in a URL.
    Url,
    /// Persisted by some other adapter.
    Other,
}

/// Why a node is being initialized in a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Trigger {
    /// First access was a read.
    Get,
    /// First access was a write.
    Set,
}

/// Type-erased node as seen by stores.
pub trait Node: Send + Sync + 'static {
    /// Unique key.
    fn key(&self) -> &NodeKey;

    /// Atom or selector.
    fn kind(&self) -> NodeKind;

    /// Current loadable in `tree`, evaluating if needed.
    fn get(&self, store: &StoreRef, tree: &Arc<TreeState>, stack: &EvalStack)
        -> Result<Loadable, Error>;

    /// Current loadable in `tree` if it is known without evaluating.
    fn peek(&self, store: &StoreRef, tree: &Arc<TreeState>) -> Option<Loadable>;

    /// Returns true if [`set`](Node::set) is supported.
    fn is_writable(&self) -> bool;

    /// Compute the writes that setting this node to `value` produces.
    ///
    /// `stack` holds the set handlers in progress, so a handler that ends up
    /// setting itself again is reported as a cycle.
    fn set(
        &self,
        store: &StoreRef,
        tree: &Arc<TreeState>,
        value: WriteValue,
        stack: &EvalStack,
    ) -> Result<WriteSet, Error>;

    /// Run once per store on first use; the cleanup runs on release.
    fn init(&self, store: &StoreRef, tree: &Arc<TreeState>, trigger: Trigger) -> Cleanup;

    /// Drop cached results derived from `tree`.
    fn invalidate(&self, _tree: &TreeState) {}

    /// Drop every cached result so the next read re-evaluates.
    fn clear_cache(&self, _store: &StoreRef, _tree: &Arc<TreeState>) {}

    /// What keeps the node alive.
    fn retained_by(&self) -> RetainedBy {
        RetainedBy::Root
    }

    /// Whether restoring a snapshot overwrites this node.
    fn should_restore_from_snapshots(&self) -> bool {
        true
    }

    /// Persistence tag.
    fn persistence(&self) -> PersistenceType {
        PersistenceType::None
    }

    /// Whether releasing the node also unregisters it.
    fn should_delete_config_on_release(&self) -> bool {
        false
    }

    /// Equality of two values of this node. Defaults to identity.
    fn output_eq(&self, a: &Value, b: &Value) -> bool {
        Arc::ptr_eq(a, b)
    }
}

/// Typed handle to a readable node.
pub trait Readable<T>: Send + Sync {
    /// Key of the node.
    fn key(&self) -> &NodeKey;

    /// The node definition, registered on first use.
    fn node(&self) -> Arc<dyn Node>;
}

/// Typed handle to a writable node.
pub trait Writable<T>: Readable<T> {}

/// Equality used for early cutoff: values equal to the previous one keep its
/// identity, so downstream caches still hit.
pub type OutputEq<T> = fn(&T, &T) -> bool;

/// [`OutputEq`] using `PartialEq`.
pub fn partial_eq<T: PartialEq>(a: &T, b: &T) -> bool {
    a == b
}

pub(crate) fn typed_output_eq<T: Send + Sync + 'static>(
    eq: Option<OutputEq<T>>,
    a: &Value,
    b: &Value,
) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    match (eq, a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(eq), Some(a), Some(b)) => eq(a, b),
        _ => false,
    }
}

/// Node definitions keyed by [`NodeKey`].
#[derive(Default)]
pub struct Registry {
    nodes: RwLock<HashMap<NodeKey, Arc<dyn Node>, RandomState>>,
}

fn same_node(a: &Arc<dyn Node>, b: &Arc<dyn Node>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl Registry {
    /// Register `node` unless its key is taken; returns the registered node.
    ///
    /// A different node under an existing key is ignored with a warning.
    pub fn register(&self, node: Arc<dyn Node>) -> Arc<dyn Node> {
        if let Some(existing) = self.nodes.read().get(node.key()) {
            if !same_node(existing, &node) {
                tracing::warn!(key = %node.key(), "duplicate node key; keeping the first definition");
            }
            return existing.clone();
        }
        let mut nodes = self.nodes.write();
        nodes.entry(node.key().clone()).or_insert(node).clone()
    }

    /// The node registered under `key`.
    pub fn get(&self, key: &NodeKey) -> Result<Arc<dyn Node>, Error> {
        self.get_maybe(key)
            .ok_or_else(|| Error::UnknownNode(key.clone()))
    }

    /// The node registered under `key`, if any.
    pub fn get_maybe(&self, key: &NodeKey) -> Option<Arc<dyn Node>> {
        self.nodes.read().get(key).cloned()
    }

    /// Returns true if `key` is registered.
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.read().contains_key(key)
    }

    /// All registered keys.
    pub fn keys(&self) -> Vec<NodeKey> {
        self.nodes.read().keys().cloned().collect()
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Unregister `key` if its node asks for that on release.
    pub(crate) fn delete_if_possible(&self, key: &NodeKey) -> bool {
        let mut nodes = self.nodes.write();
        let deletable = nodes
            .get(key)
            .is_some_and(|node| node.should_delete_config_on_release());
        if deletable {
            nodes.remove(key);
        }
        deletable
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("nodes", &self.len())
            .finish()
    }
}
