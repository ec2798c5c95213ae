//! Snapshots: isolation, reference counting, caching and time travel.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use atom_flow::{
    Atom, Error, NodeFilter, NodeKey, RetainedBy, Root, RuntimeConfig, Selector, Snapshot,
    StoreId, TaskQueue, Tracer, AUTO_RELEASE_DELAY,
};
use futures::executor::block_on;

fn config_with_queue() -> (RuntimeConfig, Arc<TaskQueue>) {
    let queue = Arc::new(TaskQueue::new());
    let config = RuntimeConfig::builder().scheduler(queue.clone()).build();
    (config, queue)
}

// Snapshots of this root only release when the test advances its queue.
fn queued_root() -> Root {
    Root::new(config_with_queue().0)
}

#[test]
fn test_map_leaves_original_untouched() {
    let config = config_with_queue().0;
    let a = Atom::new("a", String::from("DEFAULT"));

    let original = Snapshot::fresh(config);
    let mapped = original
        .map(|snapshot| snapshot.set(&a, "MAPPED".to_string()).unwrap())
        .unwrap();

    assert_eq!(*original.get(&a).unwrap(), "DEFAULT");
    assert_eq!(*mapped.get(&a).unwrap(), "MAPPED");
}

#[test]
fn test_mutable_snapshot_never_leaks_into_parent() {
    let root = queued_root();
    let a = Atom::new("a", 1i32);
    let doubled = Selector::new("doubled", {
        let a = a.clone();
        move |ctx| Ok(*ctx.get(&a)? * 2)
    });
    root.set(&a, 5).unwrap();

    let parent = root.snapshot();
    let before = parent.get_loadable(&doubled).unwrap();
    let child = parent
        .map(|snapshot| {
            snapshot.set(&a, 100).unwrap();
            snapshot.update(&a, |v| v + 1).unwrap();
        })
        .unwrap();

    assert_eq!(*child.get(&doubled).unwrap(), 202);
    assert!(parent.get_loadable(&doubled).unwrap().is_same(&before));
    assert_eq!(*parent.get(&a).unwrap(), 5);
    assert_eq!(*root.get(&a).unwrap(), 5);
}

#[test]
fn test_mapped_snapshot_gets_new_id() {
    let root = queued_root();
    let a = Atom::new("a", 0i32);
    let snapshot = root.snapshot();
    let mapped = snapshot.map(|s| s.set(&a, 1).unwrap()).unwrap();

    assert_eq!(snapshot.get_id().unwrap(), root.state_id());
    assert_ne!(mapped.get_id().unwrap(), snapshot.get_id().unwrap());
    assert_ne!(mapped.get_store_id().unwrap(), root.store_id());
}

#[test]
fn test_async_map() {
    let config = config_with_queue().0;
    let a = Atom::new("a", 0i32);
    let writer = a.clone();

    let snapshot = Snapshot::fresh(config);
    let mapped = block_on(snapshot.async_map(|mutable| async move {
        mutable.set(&writer, 3).unwrap();
    }))
    .unwrap();

    assert_eq!(*mapped.get(&a).unwrap(), 3);
    assert_eq!(*snapshot.get(&a).unwrap(), 0);
}

// ============================================================================
// Reference counting
// ============================================================================

#[test]
fn test_released_snapshot_cannot_be_retained() {
    let (config, queue) = config_with_queue();
    let snapshot = Snapshot::fresh(config);
    queue.advance(AUTO_RELEASE_DELAY);

    for _ in 0..3 {
        assert!(matches!(snapshot.retain(), Err(Error::RetainReleased)));
    }
    assert!(!snapshot.is_retained());
}

#[test]
fn test_default_scheduler_releases_unretained_snapshots() {
    let root = Root::default();
    let a = Atom::new("a", 0i32);
    let dropped = root.snapshot();
    let kept = Snapshot::fresh(RuntimeConfig::new());
    let _retainer = kept.retain().unwrap();
    root.set(&a, 1).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while dropped.is_retained() && Instant::now() < deadline {
        thread::sleep(AUTO_RELEASE_DELAY);
    }
    assert!(!dropped.is_retained());
    assert!(kept.is_retained());
}

#[test]
fn test_retained_snapshot_outlives_auto_release() {
    let (config, queue) = config_with_queue();
    let a = Atom::new("a", 7i32);
    let snapshot = Snapshot::fresh(config);
    let retainer = snapshot.retain().unwrap();

    queue.run_until_idle();
    assert_eq!(*snapshot.get(&a).unwrap(), 7);

    drop(retainer);
    assert!(!snapshot.is_retained());
}

#[test]
fn test_strict_reads_of_released_snapshot_fail() {
    let queue = Arc::new(TaskQueue::new());
    let config = RuntimeConfig::builder()
        .strict(true)
        .scheduler(queue.clone())
        .build();
    let a = Atom::new("a", 0i32);
    let snapshot = Snapshot::fresh(config);
    queue.run_until_idle();

    assert!(matches!(snapshot.get(&a), Err(Error::SnapshotReleased)));
    assert!(matches!(
        snapshot.map(|_| {}),
        Err(Error::SnapshotReleased)
    ));
}

// ============================================================================
// Releasing
// ============================================================================

#[derive(Clone, Default)]
struct ReleaseLog {
    snapshots: Arc<AtomicU32>,
    nodes: Arc<Mutex<Vec<NodeKey>>>,
    violations: Arc<Mutex<Vec<Error>>>,
}

impl Tracer for ReleaseLog {
    fn on_node_released(&self, _store: StoreId, key: &NodeKey) {
        self.nodes.lock().unwrap().push(key.clone());
    }

    fn on_snapshot_released(&self, _store: StoreId) {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
    }

    fn on_violation(&self, error: &Error) {
        self.violations.lock().unwrap().push(error.clone());
    }
}

fn release_mapped_snapshot(memory_management: bool) -> (ReleaseLog, u32) {
    let log = ReleaseLog::default();
    let queue = Arc::new(TaskQueue::new());
    let config = RuntimeConfig::builder()
        .memory_management(memory_management)
        .scheduler(queue.clone())
        .tracer(log.clone())
        .build();
    let cleanups = Arc::new(AtomicU32::new(0));
    let draft = Atom::builder("draft", 0i32)
        .retained_by(RetainedBy::Components)
        .effect({
            let cleanups = cleanups.clone();
            move |_| {
                let cleanups = cleanups.clone();
                Ok(Some(Box::new(move || {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                })))
            }
        })
        .build();

    let base = Snapshot::fresh(config);
    let mapped = base
        .map(|snapshot| snapshot.set(&draft, 5).unwrap())
        .unwrap();
    assert_eq!(*mapped.get(&draft).unwrap(), 5);
    assert!(log.nodes.lock().unwrap().is_empty());

    queue.advance(AUTO_RELEASE_DELAY);
    assert!(!base.is_retained());
    assert!(!mapped.is_retained());
    let cleanups = cleanups.load(Ordering::SeqCst);
    (log, cleanups)
}

#[test]
fn test_release_with_memory_management_sweeps_retained_nodes() {
    let (log, cleanups) = release_mapped_snapshot(true);
    assert_eq!(cleanups, 1);
    assert_eq!(log.snapshots.load(Ordering::SeqCst), 2);
    assert_eq!(*log.nodes.lock().unwrap(), vec![NodeKey::new("draft")]);
}

#[test]
fn test_release_without_memory_management_keeps_node_counts() {
    let (log, cleanups) = release_mapped_snapshot(false);
    assert_eq!(cleanups, 1);
    assert_eq!(log.snapshots.load(Ordering::SeqCst), 2);
    assert!(log.nodes.lock().unwrap().is_empty());
}

#[test]
fn test_lenient_retain_of_released_snapshot_is_reported() {
    let log = ReleaseLog::default();
    let queue = Arc::new(TaskQueue::new());
    let config = RuntimeConfig::builder()
        .strict(false)
        .scheduler(queue.clone())
        .tracer(log.clone())
        .build();
    let snapshot = Snapshot::fresh(config);
    queue.run_until_idle();

    assert!(snapshot.retain().is_err());
    let violations = log.violations.lock().unwrap();
    assert_eq!(violations.len(), 1);
    assert!(matches!(violations[0], Error::RetainReleased));
}

// ============================================================================
// Caching
// ============================================================================

#[test]
fn test_snapshots_are_reused_until_a_write() {
    let root = queued_root();
    let a = Atom::new("a", 0i32);

    let first = root.snapshot();
    let second = root.snapshot();
    assert!(first.ptr_eq(&second));

    root.set(&a, 1).unwrap();
    let third = root.snapshot();
    assert!(!first.ptr_eq(&third));
    assert_eq!(*first.get(&a).unwrap(), 0);
    assert_eq!(*third.get(&a).unwrap(), 1);
}

#[test]
fn test_cleanup_of_released_snapshot_can_take_snapshots() {
    let (config, queue) = config_with_queue();
    let root = Root::new(config);
    let replacement = Arc::new(Mutex::new(None));
    let watched = Atom::builder("watched", 0i32)
        .effect({
            let root = root.clone();
            let replacement = replacement.clone();
            move |_| {
                let root = root.clone();
                let replacement = replacement.clone();
                Ok(Some(Box::new(move || {
                    *replacement.lock().unwrap() = Some(root.snapshot());
                })))
            }
        })
        .build();

    let first = root.snapshot();
    assert_eq!(*first.get(&watched).unwrap(), 0);
    queue.advance(AUTO_RELEASE_DELAY);

    let replacement = replacement.lock().unwrap().take().unwrap();
    assert!(!replacement.ptr_eq(&first));
    assert!(replacement.is_retained());
}

#[test]
fn test_released_snapshot_is_not_reused() {
    let (config, queue) = config_with_queue();
    let root = Root::new(config);
    let first = root.snapshot();
    queue.advance(AUTO_RELEASE_DELAY);

    let second = root.snapshot();
    assert!(!first.ptr_eq(&second));
    assert!(second.is_retained());
}

// ============================================================================
// Node listing
// ============================================================================

#[test]
fn test_get_nodes_filters() {
    let root = queued_root();
    let a = Atom::new("a", 0i32);
    let b = Atom::new("b", 0i32);
    root.get(&a).unwrap();
    root.set(&b, 1).unwrap();

    let snapshot = root.snapshot();
    let initialized = snapshot
        .get_nodes(NodeFilter {
            is_initialized: Some(true),
            ..NodeFilter::default()
        })
        .unwrap();
    assert!(initialized.contains(&NodeKey::new("a")));
    assert!(initialized.contains(&NodeKey::new("b")));

    let modified = snapshot
        .get_nodes(NodeFilter {
            is_modified: Some(true),
            ..NodeFilter::default()
        })
        .unwrap();
    assert_eq!(modified, vec![NodeKey::new("b")]);
}

// ============================================================================
// Time travel and observation
// ============================================================================

#[test]
fn test_goto_snapshot_restores_values_and_id() {
    let root = queued_root();
    let a = Atom::new("a", 0i32);
    let b = Atom::new("b", String::from("x"));
    root.set(&b, "saved".to_string()).unwrap();

    let saved = root.snapshot();
    root.set(&a, 5).unwrap();
    root.set(&b, "later".to_string()).unwrap();

    root.goto_snapshot(&saved).unwrap();
    assert_eq!(*root.get(&a).unwrap(), 0);
    assert_eq!(*root.get(&b).unwrap(), "saved");
    assert_eq!(root.state_id(), saved.get_id().unwrap());
}

#[test]
fn test_goto_snapshot_skips_opted_out_atoms() {
    let root = queued_root();
    let sticky = Atom::builder("sticky", 0i32)
        .restore_from_snapshots(false)
        .build();

    let saved = root.snapshot();
    root.set(&sticky, 9).unwrap();
    root.goto_snapshot(&saved).unwrap();
    assert_eq!(*root.get(&sticky).unwrap(), 9);
}

#[test]
fn test_observer_sees_both_states() {
    let root = queued_root();
    let a = Atom::new("a", 0i32);
    root.get(&a).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _observer = root.observe_transactions({
        let seen = seen.clone();
        let a = a.clone();
        move |current, previous| {
            let now = *current.get(&a).unwrap();
            let before = *previous.get(&a).unwrap();
            seen.lock().unwrap().push((now, before));
        }
    });

    root.set(&a, 1).unwrap();
    root.set(&a, 2).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![(1, 0), (2, 1)]);
}

#[test]
fn test_with_initializer_seeds_root() {
    let a = Atom::new("a", 0i32);
    let runs = Arc::new(AtomicU32::new(0));
    let tracked = Atom::builder("tracked", 0i32)
        .effect({
            let runs = runs.clone();
            move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })
        .build();

    let root = Root::with_initializer(config_with_queue().0, |snapshot| {
        snapshot.set(&a, 7).unwrap();
        snapshot.set(&tracked, 1).unwrap();
    })
    .unwrap();

    assert_eq!(*root.get(&a).unwrap(), 7);
    assert_eq!(*root.get(&tracked).unwrap(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}
