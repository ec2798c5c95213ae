//! Retention: nodes held by components and zones are swept once released.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use atom_flow::{
    Atom, AtomFamily, NodeKey, Readable, RetainedBy, RetentionZone, Root, RuntimeConfig, Selector,
    StoreId, Tracer,
};

#[derive(Clone, Default)]
struct ReleaseCounter(Arc<AtomicU32>);

impl Tracer for ReleaseCounter {
    fn on_node_released(&self, _store: StoreId, _key: &NodeKey) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_root_retained_nodes_are_never_swept() {
    let root = Root::default();
    let a = Atom::new("a", 0i32);
    let subscription = root.subscribe(&a, |_| {});
    root.set(&a, 1).unwrap();

    subscription.release();
    root.sweep();
    assert_eq!(*root.get(&a).unwrap(), 1);
}

#[test]
fn test_component_retained_atom_is_released() {
    let counter = ReleaseCounter::default();
    let root = Root::new(RuntimeConfig::builder().tracer(counter.clone()).build());
    let a = Atom::builder("a", 0i32)
        .retained_by(RetainedBy::Components)
        .build();

    let guard = root.retain(a.key().clone());
    root.set(&a, 5).unwrap();
    root.sweep();
    assert_eq!(*root.get(&a).unwrap(), 5);

    guard.release();
    root.sweep();
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    assert!(!root.get_info(&a).unwrap().is_active);
    assert_eq!(*root.get(&a).unwrap(), 0);
}

#[test]
fn test_zone_keeps_members_alive() {
    let root = Root::default();
    let zone = RetentionZone::new("editor");
    let draft = Atom::builder("draft", String::new())
        .retained_by(RetainedBy::Zones(vec![zone.clone()]))
        .build();

    let guard = root.retain(zone.clone());
    root.set(&draft, "hello".to_string()).unwrap();
    root.sweep();
    assert_eq!(*root.get(&draft).unwrap(), "hello");

    drop(guard);
    root.sweep();
    assert_eq!(*root.get(&draft).unwrap(), "");
}

#[test]
fn test_released_selector_releases_unused_upstream() {
    let root = Root::default();
    let source = Atom::builder("source", 2i32)
        .retained_by(RetainedBy::Components)
        .build();
    let squared = Selector::builder("squared", {
        let source = source.clone();
        move |ctx| Ok(*ctx.get(&source)? * *ctx.get(&source)?)
    })
    .retained_by(RetainedBy::Components)
    .build();

    let source_guard = root.retain(source.key().clone());
    root.set(&source, 3).unwrap();
    let subscription = root.subscribe(&squared, |_| {});
    assert_eq!(*root.get(&squared).unwrap(), 9);
    drop(source_guard);
    root.sweep();

    // Still needed downstream.
    assert!(root.get_info(&source).unwrap().is_active);

    subscription.release();
    root.sweep();
    assert!(!root.get_info(&squared).unwrap().is_active);
    assert!(!root.get_info(&source).unwrap().is_active);
}

#[test]
fn test_released_family_member_is_unregistered() {
    let root = Root::default();
    let rows: AtomFamily<i32, u32> =
        AtomFamily::new("row", |id| *id as i32).retained_by(RetainedBy::Components);
    let row = rows.get(7);
    let key = Readable::key(&row).clone();

    let subscription = root.subscribe(&row, |_| {});
    root.get(&row).unwrap();
    assert!(root.config().registry().contains(&key));

    subscription.release();
    root.sweep();
    assert!(!root.config().registry().contains(&key));
}

#[test]
fn test_commit_sweeps_released_nodes() {
    let root = Root::default();
    let scratch = Atom::builder("scratch", 0i32)
        .retained_by(RetainedBy::Components)
        .build();
    let other = Atom::new("other", 0i32);

    let guard = root.retain(scratch.key().clone());
    root.set(&scratch, 4).unwrap();
    drop(guard);

    root.set(&other, 1).unwrap();
    assert_eq!(*root.get(&scratch).unwrap(), 0);
}
