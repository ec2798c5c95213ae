//! Reuse of the last snapshot taken from a store.
//!
//! Taking a snapshot clones the store's state, so repeated snapshots of an
//! unchanged store hand out the same one. Any write invalidates the entry.

use std::fmt;

use parking_lot::Mutex;

use crate::key::{StateId, StoreId};
use crate::snapshot::{Snapshot, WeakSnapshot};
use crate::state::clone_store_state;
use crate::store::StoreRef;

/// Which tree of a store a snapshot shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotVersion {
    /// The in-flight tree if a batch is open, else the committed one.
    Latest,
    /// The tree before the commit in progress; the committed one otherwise.
    Previous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheKey {
    store: StoreId,
    version: SnapshotVersion,
    next: Option<StateId>,
    current: StateId,
    previous: Option<StateId>,
}

#[derive(Default)]
pub(crate) struct SnapshotCache {
    entry: Mutex<Option<(CacheKey, WeakSnapshot)>>,
}

impl SnapshotCache {
    pub(crate) fn invalidate(&self) {
        self.entry.lock().take();
    }

    fn lookup(&self, key: &CacheKey) -> Option<Snapshot> {
        let cached = {
            let entry = self.entry.lock();
            match entry.as_ref() {
                Some((cached_key, snapshot)) if cached_key == key => snapshot.clone(),
                _ => return None,
            }
        };
        // Upgrading may hand us the last strong handle, whose drop runs node
        // cleanups that can take snapshots themselves.
        cached.upgrade().filter(Snapshot::is_retained)
    }
}

impl fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entry = self.entry.lock();
        f.debug_struct("SnapshotCache")
            .field("key", &entry.as_ref().map(|(key, _)| key))
            .finish()
    }
}

/// Snapshot of `store` at `version`, reused while nothing changed.
pub fn clone_snapshot(store: &StoreRef, version: SnapshotVersion) -> Snapshot {
    let (key, tree) = {
        let state = store.get_state();
        let key = CacheKey {
            store: store.store_id(),
            version,
            next: state.next_tree.as_ref().map(|tree| tree.version),
            current: state.current_tree.version,
            previous: state.previous_tree.as_ref().map(|tree| tree.version),
        };
        let tree = match version {
            SnapshotVersion::Latest => state.latest_tree().clone(),
            SnapshotVersion::Previous => state
                .previous_tree
                .clone()
                .unwrap_or_else(|| state.current_tree.clone()),
        };
        (key, tree)
    };

    let cache = store.config().snapshot_cache();
    if let Some(snapshot) = cache.lookup(&key) {
        return snapshot;
    }

    let state = clone_store_state(store.as_ref(), &tree, false);
    let snapshot = Snapshot::from_state(store.config().clone(), state, Some(store.store_id()));
    *cache.entry.lock() = Some((key, snapshot.downgrade()));
    snapshot
}
