//! Key/value maps keyed by [`NodeKey`] with cheap, independent clones.
//!
//! Two strategies implement the same [`NodeMap`] interface:
//! - [`BuiltinMap`]: a plain hash map; `clone` copies every entry.
//! - [`HamtMap`]: a hash array mapped trie (`im::HashMap`); `clone` is O(1) and
//!   copies only the paths touched by later writes.
//!
//! [`PersistentMap`] picks one at construction from a [`MapKind`]. Callers must
//! not depend on which one is active.

use std::collections::HashMap;

use ahash::RandomState;

use crate::key::NodeKey;

/// Strategy used for tree-state maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MapKind {
    /// Plain hash map, full copy on clone.
    Builtin,
    /// Structurally shared trie, O(1) clone.
    #[default]
    Hamt,
}

/// Common interface of the map strategies.
///
/// `clone()` must return a map such that writes to either copy never show up
/// in the other.
pub trait NodeMap<V: Clone>: Clone {
    /// Value for `key`.
    fn get(&self, key: &NodeKey) -> Option<&V>;
    /// Returns true if `key` is present.
    fn has(&self, key: &NodeKey) -> bool;
    /// Insert or overwrite.
    fn set(&mut self, key: NodeKey, value: V);
    /// Remove, returning the old value.
    fn delete(&mut self, key: &NodeKey) -> Option<V>;
    /// Number of entries.
    fn size(&self) -> usize;
    /// All keys, unordered.
    fn keys(&self) -> Vec<NodeKey>;
    /// All entries, unordered.
    fn entries(&self) -> Vec<(NodeKey, V)>;
    /// Copy into a plain map.
    fn to_map(&self) -> HashMap<NodeKey, V, RandomState> {
        self.entries().into_iter().collect()
    }
}

/// Map backed by a plain hash map.
#[derive(Debug, Clone)]
pub struct BuiltinMap<V> {
    map: HashMap<NodeKey, V, RandomState>,
}

impl<V> Default for BuiltinMap<V> {
    fn default() -> Self {
        Self {
            map: HashMap::default(),
        }
    }
}

impl<V: Clone> NodeMap<V> for BuiltinMap<V> {
    fn get(&self, key: &NodeKey) -> Option<&V> {
        self.map.get(key)
    }

    fn has(&self, key: &NodeKey) -> bool {
        self.map.contains_key(key)
    }

    fn set(&mut self, key: NodeKey, value: V) {
        self.map.insert(key, value);
    }

    fn delete(&mut self, key: &NodeKey) -> Option<V> {
        self.map.remove(key)
    }

    fn size(&self) -> usize {
        self.map.len()
    }

    fn keys(&self) -> Vec<NodeKey> {
        self.map.keys().cloned().collect()
    }

    fn entries(&self) -> Vec<(NodeKey, V)> {
        self.map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn to_map(&self) -> HashMap<NodeKey, V, RandomState> {
        self.map.clone()
    }
}

/// Map backed by a hash array mapped trie with structural sharing.
#[derive(Debug, Clone)]
pub struct HamtMap<V: Clone> {
    map: im::HashMap<NodeKey, V>,
}

impl<V: Clone> Default for HamtMap<V> {
    fn default() -> Self {
        Self {
            map: im::HashMap::new(),
        }
    }
}

impl<V: Clone> NodeMap<V> for HamtMap<V> {
    fn get(&self, key: &NodeKey) -> Option<&V> {
        self.map.get(key)
    }

    fn has(&self, key: &NodeKey) -> bool {
        self.map.contains_key(key)
    }

    fn set(&mut self, key: NodeKey, value: V) {
        self.map.insert(key, value);
    }

    fn delete(&mut self, key: &NodeKey) -> Option<V> {
        self.map.remove(key)
    }

    fn size(&self) -> usize {
        self.map.len()
    }

    fn keys(&self) -> Vec<NodeKey> {
        self.map.keys().cloned().collect()
    }

    fn entries(&self) -> Vec<(NodeKey, V)> {
        self.map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A [`NodeMap`] whose strategy is chosen at construction.
#[derive(Debug, Clone)]
pub enum PersistentMap<V: Clone> {
    /// See [`BuiltinMap`].
    Builtin(BuiltinMap<V>),
    /// See [`HamtMap`].
    Hamt(HamtMap<V>),
}

impl<V: Clone> PersistentMap<V> {
    /// Create an empty map of the given kind.
    pub fn new(kind: MapKind) -> Self {
        match kind {
            MapKind::Builtin => PersistentMap::Builtin(BuiltinMap::default()),
            MapKind::Hamt => PersistentMap::Hamt(HamtMap::default()),
        }
    }

    /// The active strategy.
    pub fn kind(&self) -> MapKind {
        match self {
            PersistentMap::Builtin(_) => MapKind::Builtin,
            PersistentMap::Hamt(_) => MapKind::Hamt,
        }
    }

    /// Returns true if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl<V: Clone> NodeMap<V> for PersistentMap<V> {
    fn get(&self, key: &NodeKey) -> Option<&V> {
        match self {
            PersistentMap::Builtin(map) => map.get(key),
            PersistentMap::Hamt(map) => map.get(key),
        }
    }

    fn has(&self, key: &NodeKey) -> bool {
        match self {
            PersistentMap::Builtin(map) => map.has(key),
            PersistentMap::Hamt(map) => map.has(key),
        }
    }

    fn set(&mut self, key: NodeKey, value: V) {
        match self {
            PersistentMap::Builtin(map) => map.set(key, value),
            PersistentMap::Hamt(map) => map.set(key, value),
        }
    }

    fn delete(&mut self, key: &NodeKey) -> Option<V> {
        match self {
            PersistentMap::Builtin(map) => map.delete(key),
            PersistentMap::Hamt(map) => map.delete(key),
        }
    }

    fn size(&self) -> usize {
        match self {
            PersistentMap::Builtin(map) => map.size(),
            PersistentMap::Hamt(map) => map.size(),
        }
    }

    fn keys(&self) -> Vec<NodeKey> {
        match self {
            PersistentMap::Builtin(map) => map.keys(),
            PersistentMap::Hamt(map) => map.keys(),
        }
    }

    fn entries(&self) -> Vec<(NodeKey, V)> {
        match self {
            PersistentMap::Builtin(map) => map.entries(),
            PersistentMap::Hamt(map) => map.entries(),
        }
    }

    fn to_map(&self) -> HashMap<NodeKey, V, RandomState> {
        match self {
            PersistentMap::Builtin(map) => map.to_map(),
            PersistentMap::Hamt(map) => map.to_map(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(i: u8) -> NodeKey {
        NodeKey::new(format!("k{}", i))
    }

    fn check_basic(kind: MapKind) {
        let mut map = PersistentMap::new(kind);
        assert_eq!(map.kind(), kind);
        assert!(map.is_empty());

        map.set(key(1), 10);
        map.set(key(2), 20);
        map.set(key(1), 11);
        assert_eq!(map.get(&key(1)), Some(&11));
        assert!(map.has(&key(2)));
        assert_eq!(map.size(), 2);

        assert_eq!(map.delete(&key(2)), Some(20));
        assert!(!map.has(&key(2)));
        assert_eq!(map.keys(), vec![key(1)]);
        assert_eq!(map.to_map().get(&key(1)), Some(&11));
    }

    #[test]
    fn test_builtin_basic() {
        check_basic(MapKind::Builtin);
    }

    #[test]
    fn test_hamt_basic() {
        check_basic(MapKind::Hamt);
    }

    #[test]
    fn test_clone_is_independent_both_ways() {
        for kind in [MapKind::Builtin, MapKind::Hamt] {
            let mut original = PersistentMap::new(kind);
            original.set(key(1), "a");
            let mut copy = original.clone();

            copy.set(key(1), "b");
            copy.set(key(2), "c");
            original.delete(&key(1));

            assert_eq!(original.get(&key(1)), None);
            assert_eq!(original.get(&key(2)), None);
            assert_eq!(copy.get(&key(1)), Some(&"b"));
            assert_eq!(copy.get(&key(2)), Some(&"c"));
        }
    }

    proptest! {
        #[test]
        fn prop_clone_set_never_leaks(
            entries in proptest::collection::vec((0u8..32, any::<i32>()), 0..64),
            k in 0u8..32,
            v in any::<i32>(),
            hamt in any::<bool>(),
        ) {
            let kind = if hamt { MapKind::Hamt } else { MapKind::Builtin };
            let mut map = PersistentMap::new(kind);
            for (k, v) in entries {
                map.set(key(k), v);
            }
            let before = map.get(&key(k)).copied();
            let mut copy = map.clone();
            copy.set(key(k), v);
            prop_assert_eq!(map.get(&key(k)).copied(), before);
            prop_assert_eq!(copy.get(&key(k)).copied(), Some(v));
        }
    }
}
