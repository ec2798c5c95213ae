//! Per-version dependency graph.
//!
//! `node_deps[x]` is the set of nodes `x` read during its latest evaluation in
//! that version; `node_to_node_subscriptions[y]` is the exact inverse and is
//! maintained incrementally on every merge.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ahash::RandomState;

use crate::error::{recoverable_violation, Error};
use crate::key::{NodeKey, StateId};
use crate::store::Store;

/// A set of node keys.
pub type KeySet = HashSet<NodeKey, RandomState>;

/// Shared, immutable-once-published dependency set.
///
/// Sets are replaced wholesale or copied with [`Arc::make_mut`] before a write,
/// so graphs cloned from one another never observe each other's writes.
pub type DepSet = Arc<KeySet>;

/// Dependency edges of one tree version.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    node_deps: HashMap<NodeKey, DepSet, RandomState>,
    node_to_node_subscriptions: HashMap<NodeKey, DepSet, RandomState>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upstream dependencies of `key`.
    pub fn deps(&self, key: &NodeKey) -> Option<&DepSet> {
        self.node_deps.get(key)
    }

    /// Nodes that directly depend on `key`.
    pub fn subscribers(&self, key: &NodeKey) -> Option<&DepSet> {
        self.node_to_node_subscriptions.get(key)
    }

    /// All nodes with a recorded dependency set.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeKey> + '_ {
        self.node_deps.keys()
    }

    /// Returns true if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.node_deps.is_empty() && self.node_to_node_subscriptions.is_empty()
    }

    /// `keys` plus every node transitively subscribed to them.
    pub fn downstream_of<'a>(&self, keys: impl IntoIterator<Item = &'a NodeKey>) -> KeySet {
        let mut visited = KeySet::default();
        let mut visiting: Vec<NodeKey> = keys.into_iter().cloned().collect();
        while let Some(key) = visiting.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }
            if let Some(subscribers) = self.node_to_node_subscriptions.get(&key) {
                for downstream in subscribers.iter() {
                    if !visited.contains(downstream) {
                        visiting.push(downstream.clone());
                    }
                }
            }
        }
        visited
    }

    /// Drop every edge that touches `key`.
    pub fn remove_node(&mut self, key: &NodeKey) {
        if let Some(deps) = self.node_deps.remove(key) {
            for dep in deps.iter() {
                self.remove_back_edge(dep, key);
            }
        }
        self.node_to_node_subscriptions.remove(key);
    }

    fn remove_back_edge(&mut self, dep: &NodeKey, key: &NodeKey) {
        let Some(subscribers) = self.node_to_node_subscriptions.get_mut(dep) else {
            return;
        };
        Arc::make_mut(subscribers).remove(key);
        if subscribers.is_empty() {
            self.node_to_node_subscriptions.remove(dep);
        }
    }

    /// Returns true if the subscription map is the exact transpose of the
    /// dependency map.
    pub fn is_consistent(&self) -> bool {
        let forward = self.node_deps.iter().all(|(node, deps)| {
            deps.iter().all(|dep| {
                self.node_to_node_subscriptions
                    .get(dep)
                    .is_some_and(|subs| subs.contains(node))
            })
        });
        let backward = self
            .node_to_node_subscriptions
            .iter()
            .all(|(dep, subs)| {
                !subs.is_empty()
                    && subs.iter().all(|node| {
                        self.node_deps
                            .get(node)
                            .is_some_and(|deps| deps.contains(dep))
                    })
            });
        forward && backward
    }
}

/// Replace `node_deps[key]` with `new_deps` and patch the inverse edges.
///
/// When `older_graph` is given the merge only happens if `graph` still agrees
/// with it about `key`; a `graph` that already moved past the older graph was
/// advanced by a more recent evaluation and is left alone.
pub fn merge_deps_into_graph(
    key: &NodeKey,
    new_deps: &DepSet,
    graph: &mut Graph,
    older_graph: Option<&Graph>,
) {
    let old_deps = graph.node_deps.get(key).cloned();
    if let (Some(old), Some(older)) = (&old_deps, older_graph) {
        let agrees = older
            .node_deps
            .get(key)
            .is_some_and(|o| Arc::ptr_eq(o, old) || o == old);
        if !agrees {
            return;
        }
    }

    graph.node_deps.insert(key.clone(), new_deps.clone());

    for dep in new_deps.iter() {
        if old_deps.as_ref().is_some_and(|old| old.contains(dep)) {
            continue;
        }
        let subscribers = graph
            .node_to_node_subscriptions
            .entry(dep.clone())
            .or_default();
        Arc::make_mut(subscribers).insert(key.clone());
    }

    if let Some(old) = old_deps {
        for dep in old.iter().filter(|dep| !new_deps.contains(*dep)) {
            graph.remove_back_edge(dep, key);
        }
    }
}

/// Record the dependencies `key` read while being evaluated against `version`.
///
/// The merge also flows forward: into the next tree's graph when evaluating
/// the current or previous tree, and into the current tree's graph when
/// evaluating the previous one, so later trees keep what older ones learned.
/// A `version` the store no longer tracks is reported and not recorded.
pub fn save_deps_to_store(key: &NodeKey, deps: KeySet, store: &dyn Store, version: StateId) {
    let live = {
        let state = store.get_state();
        state.is_live_version(version)
    };
    if !live {
        // Nothing would ever drop a graph stored under this version.
        recoverable_violation(store.config(), Error::DiscardedTree { version });
        return;
    }

    let deps: DepSet = Arc::new(deps);
    let mut state = store.get_state();
    let current = state.current_tree.version;
    let next = state.next_tree.as_ref().map(|tree| tree.version);
    let previous = state.previous_tree.as_ref().map(|tree| tree.version);

    let graph = state.take_graph(version);
    if previous == Some(version) {
        merge_deps_into_graph(key, &deps, state.graph_mut(current), Some(&graph));
    }
    if previous == Some(version) || current == version {
        if let Some(next) = next.filter(|next| *next != version) {
            merge_deps_into_graph(key, &deps, state.graph_mut(next), Some(&graph));
        }
    }
    let mut graph = graph;
    merge_deps_into_graph(key, &deps, &mut graph, None);
    state.put_graph(version, graph);
}
