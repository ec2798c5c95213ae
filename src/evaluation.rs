//! Store-level node operations: read, peek, write, initialize, inspect.
//!
//! These are the entry points every higher layer goes through; they resolve a
//! key through the registry, make sure the node is initialized in the store,
//! and delegate to the node.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use ahash::RandomState;
use indexmap::IndexSet;

use crate::error::Error;
use crate::graph::KeySet;
use crate::key::NodeKey;
use crate::loadable::Loadable;
use crate::node::{Node, NodeKind, Trigger, WriteSet, WriteValue};
use crate::retention::initialize_retention_for_node;
use crate::state::{Cleanup, TreeState};
use crate::store::StoreRef;

/// Keys of the selectors currently being evaluated, outermost first.
///
/// Threaded explicitly through evaluation so that a key re-entering the stack
/// is reported as a cycle instead of recursing.
#[derive(Default)]
pub struct EvalStack {
    keys: RefCell<IndexSet<NodeKey, RandomState>>,
}

impl EvalStack {
    /// An empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of selectors being evaluated.
    pub fn depth(&self) -> usize {
        self.keys.borrow().len()
    }

    /// Returns true if `key` is being evaluated.
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.keys.borrow().contains(key)
    }

    /// Push `key`, failing with [`Error::Cycle`] if it is already on the stack.
    pub(crate) fn enter(&self, key: &NodeKey) -> Result<StackFrame<'_>, Error> {
        let mut keys = self.keys.borrow_mut();
        if let Some(index) = keys.get_index_of(key) {
            let mut path: Vec<NodeKey> = keys.iter().skip(index).cloned().collect();
            path.push(key.clone());
            return Err(Error::Cycle { path });
        }
        keys.insert(key.clone());
        Ok(StackFrame { stack: self })
    }
}

impl fmt::Debug for EvalStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys.borrow().iter()).finish()
    }
}

/// Pops its key when dropped.
pub(crate) struct StackFrame<'a> {
    stack: &'a EvalStack,
}

impl Drop for StackFrame<'_> {
    fn drop(&mut self) {
        self.stack.keys.borrow_mut().pop();
    }
}

/// Current loadable of `key` in `tree`, evaluating on demand.
pub fn get_node_loadable(
    store: &StoreRef,
    tree: &Arc<TreeState>,
    key: &NodeKey,
    stack: &EvalStack,
) -> Result<Loadable, Error> {
    let node = store.config().registry().get(key)?;
    initialize_node(store, tree, &node, Trigger::Get);
    node.get(store, tree, stack)
}

/// Loadable of `key` in `tree` if known without evaluating anything.
pub fn peek_node_loadable(store: &StoreRef, tree: &Arc<TreeState>, key: &NodeKey) -> Option<Loadable> {
    let node = store.config().registry().get_maybe(key)?;
    node.peek(store, tree)
}

/// Writes produced by setting `key` to `value` in `tree`.
///
/// Nothing is written yet; the caller merges the returned set into a tree.
pub fn set_node_value(
    store: &StoreRef,
    tree: &Arc<TreeState>,
    key: &NodeKey,
    value: WriteValue,
    stack: &EvalStack,
) -> Result<WriteSet, Error> {
    let node = store.config().registry().get(key)?;
    if !node.is_writable() {
        return Err(Error::ReadOnly(key.clone()));
    }
    initialize_node(store, tree, &node, Trigger::Set);
    node.set(store, tree, value, stack)
}

/// Run `node`'s one-time initialization in `store` if it has not run yet.
pub fn initialize_node(store: &StoreRef, tree: &Arc<TreeState>, node: &Arc<dyn Node>, trigger: Trigger) {
    let key = node.key();
    {
        let mut state = store.get_state();
        if state.node_cleanup_functions.contains_key(key) {
            return;
        }
        // Placeholder so re-entrant reads during init do not init twice.
        state
            .node_cleanup_functions
            .insert(key.clone(), Box::new(|| {}));
    }

    let retention_cleanup = initialize_retention_for_node(store, key, node.retained_by());
    let node_cleanup = node.init(store, tree, trigger);
    let cleanup: Cleanup = Box::new(move || {
        node_cleanup();
        retention_cleanup();
    });
    store
        .get_state()
        .node_cleanup_functions
        .insert(key.clone(), cleanup);
}

/// Run and forget the cleanup of `key` in `store`.
pub fn clean_up_node(store: &StoreRef, key: &NodeKey) {
    let cleanup = store.get_state().node_cleanup_functions.remove(key);
    if let Some(cleanup) = cleanup {
        cleanup();
    }
}

/// `keys` plus every node downstream of them in `tree`'s graph.
pub fn get_downstream_nodes<'a>(
    store: &StoreRef,
    tree: &TreeState,
    keys: impl IntoIterator<Item = &'a NodeKey>,
) -> KeySet {
    let state = store.get_state();
    match state.find_graph(tree.version) {
        Some(graph) => graph.downstream_of(keys),
        None => keys.into_iter().cloned().collect(),
    }
}

/// Debug information about one node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Loadable if known without evaluating.
    pub loadable: Option<Loadable>,
    /// Initialized in this store.
    pub is_active: bool,
    /// Atom with an explicitly stored value.
    pub is_set: bool,
    /// Written since the tree was started.
    pub is_modified: bool,
    /// Atom or selector.
    pub kind: NodeKind,
    /// Upstream dependencies.
    pub deps: Vec<NodeKey>,
    /// Downstream nodes, including the node itself.
    pub subscribers: Vec<NodeKey>,
    /// Number of node subscriptions on the node.
    pub subscriptions: usize,
}

/// Inspect `key` in `tree` without evaluating it.
pub fn peek_node_info(store: &StoreRef, tree: &Arc<TreeState>, key: &NodeKey) -> Result<NodeInfo, Error> {
    let node = store.config().registry().get(key)?;
    let loadable = node.peek(store, tree);
    let kind = node.kind();

    let (is_active, deps, subscriptions) = {
        let state = store.get_state();
        let is_active = state.known_atoms.contains(key) || state.known_selectors.contains(key);
        let subscriptions = state.node_subscriptions.get(key).map_or(0, |s| s.len());
        let deps = state
            .find_graph(tree.version)
            .and_then(|graph| graph.deps(key))
            .map(|deps| deps.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        (is_active, deps, subscriptions)
    };
    let mut subscribers: Vec<NodeKey> = get_downstream_nodes(store, tree, [key]).into_iter().collect();
    subscribers.sort();

    Ok(NodeInfo {
        loadable,
        is_active,
        is_set: kind == NodeKind::Atom && tree.has_atom_value(key),
        is_modified: tree.is_dirty(key),
        kind,
        deps,
        subscribers,
        subscriptions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_detects_reentry() {
        let stack = EvalStack::new();
        let a = NodeKey::new("a");
        let b = NodeKey::new("b");
        let _fa = stack.enter(&a).unwrap();
        let _fb = stack.enter(&b).unwrap();
        assert_eq!(stack.depth(), 2);

        match stack.enter(&a) {
            Err(Error::Cycle { path }) => assert_eq!(path, vec![a.clone(), b.clone(), a.clone()]),
            other => panic!("expected cycle, got {:?}", other.map(|_| ())),
        };
    }

    #[test]
    fn test_stack_frames_pop_on_drop() {
        let stack = EvalStack::new();
        let a = NodeKey::new("a");
        {
            let _frame = stack.enter(&a).unwrap();
            assert!(stack.contains(&a));
        }
        assert!(!stack.contains(&a));
        assert!(stack.enter(&a).is_ok());
    }
}
