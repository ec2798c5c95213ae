//! Batches commit once and notify once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use atom_flow::{batch_updates, Atom, Metadata, Root, RuntimeConfig, Selector, Value};

#[test]
fn test_batch_commits_once() {
    let root = Root::default();
    let a = Atom::new("a", 0i32);
    let b = Atom::new("b", 0i32);
    let commits = Arc::new(AtomicU32::new(0));
    let _subscription = root.subscribe_to_transactions({
        let commits = commits.clone();
        move |_| {
            commits.fetch_add(1, Ordering::SeqCst);
        }
    });

    root.batch(|| {
        root.set(&a, 1).unwrap();
        root.set(&b, 2).unwrap();
        // Reads inside the batch still see the committed state.
        assert_eq!(*root.get(&a).unwrap(), 0);
    })
    .unwrap();

    assert_eq!(commits.load(Ordering::SeqCst), 1);
    assert_eq!(*root.get(&a).unwrap(), 1);
    assert_eq!(*root.get(&b).unwrap(), 2);
}

#[test]
fn test_updates_in_a_batch_chain() {
    let root = Root::default();
    let a = Atom::new("a", 1i32);

    root.batch(|| {
        root.set(&a, 10).unwrap();
        root.update(&a, |v| v + 1).unwrap();
        root.update(&a, |v| v * 2).unwrap();
    })
    .unwrap();

    assert_eq!(*root.get(&a).unwrap(), 22);
}

#[test]
fn test_nested_batches_commit_at_the_outer_end() {
    let root = Root::default();
    let a = Atom::new("a", 0i32);
    let commits = Arc::new(AtomicU32::new(0));
    let _subscription = root.subscribe_to_transactions({
        let commits = commits.clone();
        move |_| {
            commits.fetch_add(1, Ordering::SeqCst);
        }
    });

    root.batch(|| {
        root.batch(|| root.set(&a, 1).unwrap()).unwrap();
        root.set(&a, 2).unwrap();
    })
    .unwrap();

    assert_eq!(commits.load(Ordering::SeqCst), 1);
    assert_eq!(*root.get(&a).unwrap(), 2);
}

#[test]
fn test_subscribers_notified_once_per_commit() {
    let root = Root::default();
    let a = Atom::new("a", 0i32);
    let b = Atom::new("b", 0i32);
    let sum = Selector::new("sum", {
        let (a, b) = (a.clone(), b.clone());
        move |ctx| Ok(*ctx.get(&a)? + *ctx.get(&b)?)
    });
    root.get(&sum).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _subscription = root.subscribe(&sum, {
        let seen = seen.clone();
        let root = root.clone();
        let sum = sum.clone();
        move |_| seen.lock().unwrap().push(*root.get(&sum).unwrap())
    });

    root.batch(|| {
        root.set(&a, 1).unwrap();
        root.set(&b, 2).unwrap();
    })
    .unwrap();
    root.set(&a, 5).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![3, 7]);
}

#[test]
fn test_node_transaction_subscription_filters_by_atom() {
    let root = Root::default();
    let a = Atom::new("a", 0i32);
    let b = Atom::new("b", 0i32);
    let hits = Arc::new(AtomicU32::new(0));
    let _subscription = root.subscribe_to_node_transactions(&a, {
        let hits = hits.clone();
        move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    });

    root.set(&b, 1).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    root.set(&a, 1).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unchanged_write_does_not_commit() {
    let root = Root::default();
    let a = Atom::builder("a", 0i32)
        .output_eq(atom_flow::partial_eq)
        .build();
    root.set(&a, 1).unwrap();
    let state = root.state_id();

    root.set(&a, 1).unwrap();
    assert_eq!(root.state_id(), state);
}

#[test]
fn test_mark_modified_notifies_without_change() {
    let root = Root::default();
    let a = Atom::new("a", 0i32);
    let notified = Arc::new(AtomicU32::new(0));
    let _subscription = root.subscribe(&a, {
        let notified = notified.clone();
        move |_| {
            notified.fetch_add(1, Ordering::SeqCst);
        }
    });

    root.mark_modified(&a).unwrap();
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(*root.get(&a).unwrap(), 0);
}

#[test]
fn test_transaction_metadata_is_visible_to_subscribers() {
    let root = Root::default();
    let a = Atom::new("a", 0i32);
    let seen = Arc::new(Mutex::new(None));
    let _subscription = root.subscribe_to_transactions({
        let seen = seen.clone();
        move |store| {
            let metadata = store.get_state().current_tree.metadata();
            let source = metadata
                .get("source")
                .and_then(|value| value.downcast_ref::<&str>().copied());
            *seen.lock().unwrap() = source;
        }
    });

    root.batch(|| {
        let mut metadata: Metadata = HashMap::default();
        metadata.insert("source".to_string(), Arc::new("undo") as Value);
        root.add_transaction_metadata(metadata).unwrap();
        root.set(&a, 1).unwrap();
    })
    .unwrap();

    assert_eq!(*seen.lock().unwrap(), Some("undo"));
}

#[test]
fn test_custom_batcher_wraps_batches() {
    let calls = Arc::new(AtomicU32::new(0));
    let config = RuntimeConfig::builder()
        .batcher({
            let calls = calls.clone();
            Arc::new(move |batch: &mut dyn FnMut()| {
                calls.fetch_add(1, Ordering::SeqCst);
                batch();
            })
        })
        .build();
    let root = Root::new(config.clone());
    let a = Atom::new("a", 0i32);

    batch_updates(&config, || root.set(&a, 1).unwrap()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*root.get(&a).unwrap(), 1);
}

#[test]
fn test_panicking_batch_still_commits_earlier_writes() {
    let root = Root::default();
    let a = Atom::new("a", 0i32);
    let commits = Arc::new(AtomicU32::new(0));
    let _subscription = root.subscribe_to_transactions({
        let commits = commits.clone();
        move |_| {
            commits.fetch_add(1, Ordering::SeqCst);
        }
    });

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = root.batch(|| {
            root.set(&a, 7).unwrap();
            panic!("batch callback failed");
        });
    }));

    assert!(result.is_err());
    assert_eq!(*root.get(&a).unwrap(), 7);
    assert_eq!(commits.load(Ordering::SeqCst), 1);

    // The store keeps batching normally afterwards.
    root.batch(|| root.set(&a, 8).unwrap()).unwrap();
    assert_eq!(*root.get(&a).unwrap(), 8);
}
