//! Reference counting of nodes and retention zones with a deferred sweep.
//!
//! Dropping a count to zero never releases anything by itself; it only marks
//! the retainable as a candidate. [`release_scheduled_retainables_now`] is the
//! sweep, run by a store between batches, that decides which candidates and
//! which of their upstream dependencies are really unreachable.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::RandomState;
use indexmap::IndexSet;

use crate::evaluation::clean_up_node;
use crate::error::{recoverable_violation, Error};
use crate::graph::{Graph, KeySet};
use crate::key::NodeKey;
use crate::node::RetainedBy;
use crate::state::{Cleanup, TreeState};
use crate::store::{Store, StoreRef};

static NEXT_ZONE_ID: AtomicU64 = AtomicU64::new(0);

/// Token that keeps a group of nodes alive together.
///
/// Nodes name the zones that retain them through [`RetainedBy::Zones`]; while
/// any of those zones has a positive retain count the nodes are kept.
#[derive(Clone)]
pub struct RetentionZone {
    id: u64,
    name: Arc<str>,
}

impl RetentionZone {
    /// Create a new zone. Every call returns a distinct zone.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            id: NEXT_ZONE_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name.as_ref()),
        }
    }

    /// Name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for RetentionZone {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RetentionZone {}

impl std::hash::Hash for RetentionZone {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for RetentionZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RetentionZone({}#{})", self.name, self.id)
    }
}

/// Something that can hold a retain count.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Retainable {
    /// A node.
    Node(NodeKey),
    /// A zone.
    Zone(RetentionZone),
}

impl fmt::Display for Retainable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retainable::Node(key) => write!(f, "{}", key),
            Retainable::Zone(zone) => write!(f, "{:?}", zone),
        }
    }
}

impl From<NodeKey> for Retainable {
    fn from(key: NodeKey) -> Self {
        Retainable::Node(key)
    }
}

impl From<RetentionZone> for Retainable {
    fn from(zone: RetentionZone) -> Self {
        Retainable::Zone(zone)
    }
}

/// Retention bookkeeping of one store.
#[derive(Debug, Default)]
pub struct RetentionState {
    /// Positive retain counts. Zero counts are removed.
    pub reference_counts: HashMap<Retainable, usize, RandomState>,
    /// Nodes that declared each zone in their `retained_by`.
    pub nodes_retained_by_zone: HashMap<RetentionZone, KeySet, RandomState>,
    /// Candidates for the next sweep.
    pub retainables_to_check_for_release: IndexSet<Retainable, RandomState>,
}

impl RetentionState {
    /// Retain count of `retainable`.
    pub fn count(&self, retainable: &Retainable) -> usize {
        self.reference_counts.get(retainable).copied().unwrap_or(0)
    }
}

/// Adjust the retain count of `retainable` by `delta`.
///
/// Reaching zero only schedules the retainable for the next sweep.
pub fn update_retain_count(store: &dyn Store, retainable: &Retainable, delta: isize) {
    let underflow = {
        let mut state = store.get_state();
        let current = state.retention.count(retainable) as isize;
        let updated = current + delta;
        if updated > 0 {
            state
                .retention
                .reference_counts
                .insert(retainable.clone(), updated as usize);
            false
        } else {
            state.retention.reference_counts.remove(retainable);
            state
                .retention
                .retainables_to_check_for_release
                .insert(retainable.clone());
            updated < 0
        }
    };
    if underflow {
        recoverable_violation(store.config(), Error::RetainUnderflow(retainable.to_string()));
    }
}

/// Drop the retain count of `retainable` to zero.
pub fn update_retain_count_to_zero(store: &dyn Store, retainable: &Retainable) {
    let mut state = store.get_state();
    state.retention.reference_counts.remove(retainable);
    state
        .retention
        .retainables_to_check_for_release
        .insert(retainable.clone());
}

/// Retain count held by a guard; released on drop.
#[must_use = "dropping the guard releases the retain"]
pub struct RetainGuard {
    store: Weak<dyn Store>,
    retainable: Option<Retainable>,
}

impl RetainGuard {
    pub(crate) fn new(store: &StoreRef, retainable: Retainable) -> Self {
        update_retain_count(store.as_ref(), &retainable, 1);
        Self {
            store: Arc::downgrade(store),
            retainable: Some(retainable),
        }
    }

    /// Release the retain now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for RetainGuard {
    fn drop(&mut self) {
        if let (Some(retainable), Some(store)) = (self.retainable.take(), self.store.upgrade()) {
            update_retain_count(store.as_ref(), &retainable, -1);
        }
    }
}

impl fmt::Debug for RetainGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetainGuard")
            .field("retainable", &self.retainable)
            .finish()
    }
}

fn zones_that_could_retain(retained_by: RetainedBy) -> Vec<RetentionZone> {
    match retained_by {
        RetainedBy::Zones(zones) => zones,
        RetainedBy::Root | RetainedBy::Components => Vec::new(),
    }
}

/// Record zone membership of a newly initialized node.
pub(crate) fn initialize_retention_for_node(
    store: &StoreRef,
    key: &NodeKey,
    retained_by: RetainedBy,
) -> Cleanup {
    let zones = zones_that_could_retain(retained_by);
    if zones.is_empty() {
        return Box::new(|| {});
    }
    {
        let mut state = store.get_state();
        for zone in &zones {
            state
                .retention
                .nodes_retained_by_zone
                .entry(zone.clone())
                .or_default()
                .insert(key.clone());
        }
    }
    let weak = Arc::downgrade(store);
    let key = key.clone();
    Box::new(move || {
        let Some(store) = weak.upgrade() else {
            return;
        };
        let mut state = store.get_state();
        for zone in &zones {
            if let Some(nodes) = state.retention.nodes_retained_by_zone.get_mut(zone) {
                nodes.remove(&key);
                if nodes.is_empty() {
                    state.retention.nodes_retained_by_zone.remove(zone);
                }
            }
        }
    })
}

/// Sweep: release every scheduled candidate that nothing retains anymore.
///
/// Must run between batches, while the store has no next tree.
pub fn release_scheduled_retainables_now(store: &StoreRef) {
    let scheduled = {
        let mut state = store.get_state();
        if state.next_tree.is_some() {
            None
        } else {
            Some(std::mem::take(
                &mut state.retention.retainables_to_check_for_release,
            ))
        }
    };
    match scheduled {
        Some(retainables) if !retainables.is_empty() => {
            release_retainables_now_on_current_tree(store, retainables)
        }
        Some(_) => {}
        None => recoverable_violation(store.config(), Error::SweepDuringBatch),
    }
}

fn release_retainables_now_on_current_tree(
    store: &StoreRef,
    retainables: IndexSet<Retainable, RandomState>,
) {
    let (tree, nodes) = {
        let state = store.get_state();
        let mut nodes: IndexSet<NodeKey, RandomState> = IndexSet::default();
        for retainable in retainables {
            match retainable {
                Retainable::Node(key) => {
                    nodes.insert(key);
                }
                Retainable::Zone(zone) => {
                    if let Some(members) = state.retention.nodes_retained_by_zone.get(&zone) {
                        nodes.extend(members.iter().cloned());
                    }
                }
            }
        }
        (state.current_tree.clone(), nodes)
    };

    for key in find_releasable_nodes(store, &tree, nodes) {
        release_node(store, &tree, &key);
    }
}

/// Walk from `search_from` downstream first, then upstream, collecting nodes
/// that nothing keeps alive. A node is kept if it is retained by the root, has
/// a count, sits in a retained zone, or has a kept downstream node.
fn find_releasable_nodes(
    store: &StoreRef,
    tree: &TreeState,
    search_from: IndexSet<NodeKey, RandomState>,
) -> IndexSet<NodeKey, RandomState> {
    let (graph, counts) = {
        let mut state = store.get_state();
        let graph = state.graph(tree.version);
        (graph, state.retention.reference_counts.clone())
    };
    let registry = store.config().registry();

    let mut releasable: IndexSet<NodeKey, RandomState> = IndexSet::default();
    let mut non_releasable = KeySet::default();
    let mut search = search_from;

    while !search.is_empty() {
        let mut found = Vec::new();
        for node in downstream_in_topological_order(&graph, search, &releasable, &non_releasable) {
            let retained_by = registry
                .get_maybe(&node)
                .map(|n| n.retained_by())
                .unwrap_or_default();
            let kept = retained_by == RetainedBy::Root
                || counts.contains_key(&Retainable::Node(node.clone()))
                || zones_that_could_retain(retained_by)
                    .into_iter()
                    .any(|zone| counts.contains_key(&Retainable::Zone(zone)))
                || graph
                    .subscribers(&node)
                    .is_some_and(|children| children.iter().any(|c| non_releasable.contains(c)));
            if kept {
                non_releasable.insert(node);
            } else {
                releasable.insert(node.clone());
                found.push(node);
            }
        }

        search = IndexSet::default();
        for node in &found {
            if let Some(parents) = graph.deps(node) {
                for parent in parents.iter() {
                    if !releasable.contains(parent) {
                        search.insert(parent.clone());
                    }
                }
            }
        }
    }
    releasable
}

/// Children before parents, skipping anything already classified.
fn downstream_in_topological_order(
    graph: &Graph,
    mut nodes: IndexSet<NodeKey, RandomState>,
    skip_releasable: &IndexSet<NodeKey, RandomState>,
    skip_non_releasable: &KeySet,
) -> Vec<NodeKey> {
    fn visit(
        graph: &Graph,
        node: &NodeKey,
        nodes: &mut IndexSet<NodeKey, RandomState>,
        visited: &mut KeySet,
        answer: &mut Vec<NodeKey>,
        skip_releasable: &IndexSet<NodeKey, RandomState>,
        skip_non_releasable: &KeySet,
    ) {
        if skip_releasable.contains(node) || skip_non_releasable.contains(node) {
            nodes.shift_remove(node);
            return;
        }
        if !visited.insert(node.clone()) {
            return;
        }
        if let Some(children) = graph.subscribers(node) {
            for child in children.iter() {
                visit(graph, child, nodes, visited, answer, skip_releasable, skip_non_releasable);
            }
        }
        nodes.shift_remove(node);
        answer.push(node.clone());
    }

    let mut visited = KeySet::default();
    let mut answer = Vec::new();
    while let Some(node) = nodes.first().cloned() {
        visit(
            graph,
            &node,
            &mut nodes,
            &mut visited,
            &mut answer,
            skip_releasable,
            skip_non_releasable,
        );
        // Already-visited nodes are not removed by `visit`.
        nodes.shift_remove(&node);
    }
    answer
}

/// Tear `key` down in `store`: run its cleanup, forget its values, edges and
/// bookkeeping, and unregister it if it asks for that.
pub(crate) fn release_node(store: &StoreRef, tree: &TreeState, key: &NodeKey) {
    clean_up_node(store, key);

    let config = store.config();
    let zones = config
        .registry()
        .get_maybe(key)
        .map(|node| zones_that_could_retain(node.retained_by()))
        .unwrap_or_default();
    {
        let mut state = store.get_state();
        state.known_atoms.remove(key);
        state.known_selectors.remove(key);
        state.node_transaction_subscriptions.remove(key);
        let node = Retainable::Node(key.clone());
        state.retention.reference_counts.remove(&node);
        state.retention.retainables_to_check_for_release.shift_remove(&node);
        for zone in &zones {
            if let Some(nodes) = state.retention.nodes_retained_by_zone.get_mut(zone) {
                nodes.remove(key);
            }
        }
        if let Some(graph) = state.find_graph_mut(tree.version) {
            graph.remove_node(key);
        }
    }
    tree.forget(key);
    config.registry().delete_if_possible(key);

    tracing::debug!(store = %store.store_id(), key = %key, "released node");
    config.tracer().on_node_released(store.store_id(), key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::merge_deps_into_graph;

    fn key(name: &str) -> NodeKey {
        NodeKey::new(name)
    }

    #[test]
    fn test_zone_identity() {
        let a = RetentionZone::new("zone");
        let b = RetentionZone::new("zone");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.name(), "zone");
    }

    #[test]
    fn test_topological_order_visits_children_first() {
        let mut graph = Graph::new();
        merge_deps_into_graph(&key("s1"), &Arc::new([key("a")].into_iter().collect()), &mut graph, None);
        merge_deps_into_graph(&key("s2"), &Arc::new([key("s1")].into_iter().collect()), &mut graph, None);

        let start: IndexSet<NodeKey, RandomState> = [key("a")].into_iter().collect();
        let order =
            downstream_in_topological_order(&graph, start, &IndexSet::default(), &KeySet::default());
        assert_eq!(order, vec![key("s2"), key("s1"), key("a")]);
    }

    #[test]
    fn test_topological_order_skips_classified_nodes() {
        let mut graph = Graph::new();
        merge_deps_into_graph(&key("s1"), &Arc::new([key("a")].into_iter().collect()), &mut graph, None);

        let start: IndexSet<NodeKey, RandomState> = [key("a")].into_iter().collect();
        let mut skip = KeySet::default();
        skip.insert(key("s1"));
        let order = downstream_in_topological_order(&graph, start, &IndexSet::default(), &skip);
        assert_eq!(order, vec![key("a")]);
    }
}
