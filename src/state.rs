//! Versioned tree states and the per-store state that owns them.
//!
//! A [`TreeState`] is one version of every atom value. A [`StoreState`] holds
//! the committed `current_tree`, the in-flight `next_tree` being built during
//! a batch, and the `previous_tree` kept for one commit so observers can diff.
//! Graphs are kept per version next to the trees.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::RwLock;
use slab::Slab;

use crate::graph::{Graph, KeySet};
use crate::key::{next_tree_state_version, NodeKey, StateId};
use crate::loadable::{Loadable, Value};
use crate::persistent_map::{MapKind, NodeMap, PersistentMap};
use crate::retention::RetentionState;
use crate::store::{NodeCallback, Store, TransactionCallback};

/// Opaque metadata attached to a commit.
pub type Metadata = HashMap<String, Value, RandomState>;

/// Teardown registered when a node is initialized in a store.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// One version of every atom value.
///
/// `version` identifies this particular tree; `state_id` identifies the
/// observable state and is kept when time-traveling back to an earlier one.
/// The containers sit behind locks so atom initialization can fill values into
/// a tree that readers already hold; a superseded tree is never written.
pub struct TreeState {
    /// Version of this tree.
    pub version: StateId,
    /// Identity of the observable state.
    pub state_id: StateId,
    transaction_metadata: RwLock<Metadata>,
    dirty_atoms: RwLock<KeySet>,
    atom_values: RwLock<PersistentMap<Loadable>>,
    non_validated_atoms: RwLock<PersistentMap<Value>>,
}

impl TreeState {
    /// A fresh tree with a new version and empty maps.
    pub fn empty(kind: MapKind) -> Self {
        let version = next_tree_state_version();
        Self {
            version,
            state_id: version,
            transaction_metadata: RwLock::new(Metadata::default()),
            dirty_atoms: RwLock::new(KeySet::default()),
            atom_values: RwLock::new(PersistentMap::new(kind)),
            non_validated_atoms: RwLock::new(PersistentMap::new(kind)),
        }
    }

    /// Independent copy with the same version and state id.
    pub fn copy(&self) -> Self {
        self.with_ids(self.version, self.state_id)
    }

    /// Independent copy carrying the given ids.
    pub fn with_ids(&self, version: StateId, state_id: StateId) -> Self {
        Self {
            version,
            state_id,
            transaction_metadata: RwLock::new(self.transaction_metadata.read().clone()),
            dirty_atoms: RwLock::new(self.dirty_atoms.read().clone()),
            atom_values: RwLock::new(self.atom_values.read().clone()),
            non_validated_atoms: RwLock::new(self.non_validated_atoms.read().clone()),
        }
    }

    /// Strategy of the underlying maps.
    pub fn map_kind(&self) -> MapKind {
        self.atom_values.read().kind()
    }

    /// Stored loadable of an atom.
    pub fn atom_value(&self, key: &NodeKey) -> Option<Loadable> {
        self.atom_values.read().get(key).cloned()
    }

    /// Returns true if the atom has an explicitly stored value.
    pub fn has_atom_value(&self, key: &NodeKey) -> bool {
        self.atom_values.read().has(key)
    }

    /// Store an atom value.
    pub fn set_atom_value(&self, key: NodeKey, value: Loadable) {
        self.atom_values.write().set(key, value);
    }

    /// Drop an atom value, reverting the atom to its default.
    pub fn delete_atom_value(&self, key: &NodeKey) {
        self.atom_values.write().delete(key);
    }

    /// Keys of atoms with stored values.
    pub fn atom_keys(&self) -> Vec<NodeKey> {
        self.atom_values.read().keys()
    }

    /// Raw value that has not been through the atom's validator yet.
    pub fn non_validated(&self, key: &NodeKey) -> Option<Value> {
        self.non_validated_atoms.read().get(key).cloned()
    }

    /// Returns true if an unvalidated value is present.
    pub fn has_non_validated(&self, key: &NodeKey) -> bool {
        self.non_validated_atoms.read().has(key)
    }

    /// Store an unvalidated value.
    pub fn set_non_validated(&self, key: NodeKey, value: Value) {
        self.non_validated_atoms.write().set(key, value);
    }

    /// Drop an unvalidated value.
    pub fn delete_non_validated(&self, key: &NodeKey) {
        self.non_validated_atoms.write().delete(key);
    }

    /// Keys with unvalidated values.
    pub fn non_validated_keys(&self) -> Vec<NodeKey> {
        self.non_validated_atoms.read().keys()
    }

    /// Returns true if `key` was written since this tree was started.
    pub fn is_dirty(&self, key: &NodeKey) -> bool {
        self.dirty_atoms.read().contains(key)
    }

    /// Keys written since this tree was started.
    pub fn dirty_atoms(&self) -> KeySet {
        self.dirty_atoms.read().clone()
    }

    /// Number of dirty keys.
    pub fn dirty_count(&self) -> usize {
        self.dirty_atoms.read().len()
    }

    /// Mark `key` as written.
    pub fn mark_dirty(&self, key: NodeKey) {
        self.dirty_atoms.write().insert(key);
    }

    pub(crate) fn remove_dirty(&self, key: &NodeKey) {
        self.dirty_atoms.write().remove(key);
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty_atoms.write().clear();
    }

    /// Metadata attached to the commit that produced this tree.
    pub fn metadata(&self) -> Metadata {
        self.transaction_metadata.read().clone()
    }

    /// Merge metadata into this tree.
    pub fn add_metadata(&self, metadata: Metadata) {
        self.transaction_metadata.write().extend(metadata);
    }

    pub(crate) fn clear_metadata(&self) {
        self.transaction_metadata.write().clear();
    }

    /// Remove every trace of `key`.
    pub(crate) fn forget(&self, key: &NodeKey) {
        self.delete_atom_value(key);
        self.delete_non_validated(key);
        self.remove_dirty(key);
    }
}

impl fmt::Debug for TreeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeState")
            .field("version", &self.version)
            .field("state_id", &self.state_id)
            .field("atoms", &self.atom_values.read().size())
            .field("dirty", &self.dirty_atoms.read().len())
            .finish_non_exhaustive()
    }
}

/// Everything a store owns.
pub struct StoreState {
    /// The committed tree.
    pub current_tree: Arc<TreeState>,
    /// Tree being built by the open batch.
    pub next_tree: Option<Arc<TreeState>>,
    /// Tree replaced by the commit in progress.
    pub previous_tree: Option<Arc<TreeState>>,
    /// Nesting depth of commits in progress.
    pub commit_depth: usize,
    /// Atoms initialized in this store.
    pub known_atoms: KeySet,
    /// Selectors initialized in this store.
    pub known_selectors: KeySet,
    /// Called after every commit that changed something.
    pub transaction_subscriptions: Slab<TransactionCallback>,
    /// Called after a commit that wrote the keyed atom.
    pub node_transaction_subscriptions: HashMap<NodeKey, Slab<TransactionCallback>, RandomState>,
    /// Called after a commit that changed the keyed node or anything upstream.
    pub node_subscriptions: HashMap<NodeKey, Slab<NodeCallback>, RandomState>,
    /// Teardowns of initialized nodes.
    pub node_cleanup_functions: HashMap<NodeKey, Cleanup, RandomState>,
    /// Reference counts and pending releases.
    pub retention: RetentionState,
    graphs_by_version: HashMap<StateId, Graph, RandomState>,
}

impl StoreState {
    /// Empty store state around a fresh tree.
    pub fn new(kind: MapKind) -> Self {
        Self::with_tree(Arc::new(TreeState::empty(kind)), Graph::new())
    }

    fn with_tree(tree: Arc<TreeState>, graph: Graph) -> Self {
        let mut graphs_by_version = HashMap::default();
        graphs_by_version.insert(tree.version, graph);
        Self {
            current_tree: tree,
            next_tree: None,
            previous_tree: None,
            commit_depth: 0,
            known_atoms: KeySet::default(),
            known_selectors: KeySet::default(),
            transaction_subscriptions: Slab::new(),
            node_transaction_subscriptions: HashMap::default(),
            node_subscriptions: HashMap::default(),
            node_cleanup_functions: HashMap::default(),
            retention: RetentionState::default(),
            graphs_by_version,
        }
    }

    /// The tree that reads should see: the in-flight one if a batch is open.
    pub fn latest_tree(&self) -> &Arc<TreeState> {
        self.next_tree.as_ref().unwrap_or(&self.current_tree)
    }

    /// Returns true if `version` is the current, next or previous tree.
    pub fn is_live_version(&self, version: StateId) -> bool {
        self.current_tree.version == version
            || self.next_tree.as_ref().is_some_and(|t| t.version == version)
            || self.previous_tree.as_ref().is_some_and(|t| t.version == version)
    }

    /// Graph of `version`, created empty on first access.
    pub fn graph_mut(&mut self, version: StateId) -> &mut Graph {
        self.graphs_by_version.entry(version).or_default()
    }

    /// Graph of `version`, if one was created.
    pub fn find_graph(&self, version: StateId) -> Option<&Graph> {
        self.graphs_by_version.get(&version)
    }

    pub(crate) fn find_graph_mut(&mut self, version: StateId) -> Option<&mut Graph> {
        self.graphs_by_version.get_mut(&version)
    }

    /// Copy of the graph of `version`.
    pub fn graph(&self, version: StateId) -> Graph {
        self.graphs_by_version
            .get(&version)
            .cloned()
            .unwrap_or_default()
    }

    /// Versions that currently have a graph.
    pub fn graph_versions(&self) -> Vec<StateId> {
        self.graphs_by_version.keys().copied().collect()
    }

    pub(crate) fn take_graph(&mut self, version: StateId) -> Graph {
        self.graphs_by_version.remove(&version).unwrap_or_default()
    }

    pub(crate) fn put_graph(&mut self, version: StateId, graph: Graph) {
        self.graphs_by_version.insert(version, graph);
    }

    pub(crate) fn remove_graph(&mut self, version: StateId) {
        self.graphs_by_version.remove(&version);
    }

    /// Start the in-flight tree if there is none and return it.
    ///
    /// The new tree shares the current values, starts with no dirty atoms or
    /// metadata, and gets a copy of the current graph.
    pub fn start_next_tree(&mut self) -> Arc<TreeState> {
        if let Some(next) = &self.next_tree {
            return next.clone();
        }
        let version = next_tree_state_version();
        let next = self.current_tree.with_ids(version, version);
        next.clear_dirty();
        next.clear_metadata();
        let next = Arc::new(next);
        let graph = self.graph(self.current_tree.version);
        self.graphs_by_version.insert(version, graph);
        self.next_tree = Some(next.clone());
        next
    }
}

impl fmt::Debug for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreState")
            .field("current_tree", &self.current_tree)
            .field("next_tree", &self.next_tree)
            .field("previous_tree", &self.previous_tree)
            .field("known_atoms", &self.known_atoms.len())
            .field("known_selectors", &self.known_selectors.len())
            .field("graphs", &self.graphs_by_version.len())
            .finish_non_exhaustive()
    }
}

/// Clone `store`'s state around `tree` for use by a snapshot.
///
/// Tree containers are copied so the clone never writes into the source.
/// Known node sets and the graph of `tree` are copied; initialized nodes keep
/// their entry but with a no-op cleanup, so the clone neither re-initializes
/// them nor tears down the source's effects. Subscriptions and retention
/// start empty. With `bump_version` the tree gets a new version and state id.
pub fn clone_store_state(store: &dyn Store, tree: &TreeState, bump_version: bool) -> StoreState {
    let state = store.get_state();
    let (version, state_id) = if bump_version {
        let version = next_tree_state_version();
        (version, version)
    } else {
        (tree.version, tree.state_id)
    };

    let mut cloned = StoreState::with_tree(
        Arc::new(tree.with_ids(version, state_id)),
        state.graph(tree.version),
    );
    cloned.known_atoms = state.known_atoms.clone();
    cloned.known_selectors = state.known_selectors.clone();
    cloned.node_cleanup_functions = state
        .node_cleanup_functions
        .keys()
        .map(|key| (key.clone(), Box::new(|| {}) as Cleanup))
        .collect();
    cloned
}
