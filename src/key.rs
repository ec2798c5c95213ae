//! Node keys and process-wide version / store identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique string identifying an atom or selector.
///
/// Cloning is cheap; the string is shared.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeKey(Arc<str>);

impl NodeKey {
    /// Create a key from any string.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Derive the key of a family member from its base key and parameter.
    ///
    /// The parameter is rendered with its `Debug` representation, so the same
    /// parameter value always maps to the same key.
    pub fn family<P: fmt::Debug>(base: &NodeKey, param: &P) -> Self {
        Self::new(format!("{}__{:?}", base.0, param))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for NodeKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

/// Identifier of a tree-state version.
///
/// Monotonically increasing across the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StateId(pub u64);

/// Identifier of a store instance (a live root or a snapshot's store).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StoreId(pub u64);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store#{}", self.0)
    }
}

static NEXT_TREE_STATE_VERSION: AtomicU64 = AtomicU64::new(0);
static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(0);

/// Allocate a fresh tree-state version.
pub fn next_tree_state_version() -> StateId {
    StateId(NEXT_TREE_STATE_VERSION.fetch_add(1, Ordering::Relaxed))
}

/// Allocate a fresh store id.
pub fn next_store_id() -> StoreId {
    StoreId(NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_keys_are_deterministic() {
        let base = NodeKey::new("todo");
        let a = NodeKey::family(&base, &(1, "x"));
        let b = NodeKey::family(&base, &(1, "x"));
        let c = NodeKey::family(&base, &(2, "x"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("todo__"));
    }

    #[test]
    fn test_versions_increase() {
        let v1 = next_tree_state_version();
        let v2 = next_tree_state_version();
        assert!(v2 > v1);
        assert_ne!(next_store_id(), next_store_id());
    }
}
