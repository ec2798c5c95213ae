//! Atom effects: initial values, set notifications and cleanup.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use atom_flow::state::Cleanup;
use atom_flow::{
    Atom, AtomEffect, AtomFamily, EffectContext, EffectHandle, Loadable, LoadableState, RetainedBy,
    Root, Trigger,
};

#[test]
fn test_effect_sets_initial_value() {
    let root = Root::default();
    let a = Atom::builder("a", 0i32)
        .effect(|ctx| {
            ctx.set_self(10)?;
            Ok(None)
        })
        .build();

    assert_eq!(*root.get(&a).unwrap(), 10);
    root.set(&a, 11).unwrap();
    assert_eq!(*root.get(&a).unwrap(), 11);
}

#[test]
fn test_effect_sees_trigger() {
    let root = Root::default();
    let triggers = Arc::new(Mutex::new(Vec::new()));
    let a = Atom::builder("a", 0i32)
        .effect({
            let triggers = triggers.clone();
            move |ctx| {
                triggers.lock().unwrap().push(ctx.trigger());
                Ok(None)
            }
        })
        .build();

    root.set(&a, 1).unwrap();
    root.get(&a).unwrap();
    assert_eq!(*triggers.lock().unwrap(), vec![Trigger::Set]);
}

#[test]
fn test_failing_effect_leaves_error() {
    let root = Root::default();
    let a = Atom::builder("a", 0i32)
        .effect(|_| Err(anyhow::anyhow!("storage unavailable")))
        .build();

    let loadable = root.get_loadable(&a).unwrap();
    assert_eq!(loadable.state(), LoadableState::HasError);
    root.set(&a, 1).unwrap();
    assert_eq!(*root.get(&a).unwrap(), 1);
}

#[test]
fn test_on_set_reports_changes() {
    let root = Root::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let a = Atom::builder("a", 0i32)
        .effect({
            let seen = seen.clone();
            move |ctx| {
                let seen = seen.clone();
                ctx.on_set(move |new: &Loadable, old: &Loadable, is_reset| {
                    let new = *new.value::<i32>().unwrap();
                    let old = *old.value::<i32>().unwrap();
                    seen.lock().unwrap().push((new, old, is_reset));
                });
                Ok(None)
            }
        })
        .build();

    root.get(&a).unwrap();
    root.set(&a, 1).unwrap();
    root.reset(&a).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![(1, 0, false), (0, 1, true)]);
}

#[test]
fn test_on_set_skips_own_writes() {
    let root = Root::default();
    let seen = Arc::new(AtomicU32::new(0));
    let handle: Arc<Mutex<Option<EffectHandle<i32>>>> = Arc::new(Mutex::new(None));
    let a = Atom::builder("a", 0i32)
        .effect({
            let seen = seen.clone();
            let handle = handle.clone();
            move |ctx| {
                *handle.lock().unwrap() = Some(ctx.setter());
                let seen = seen.clone();
                ctx.on_set(move |_, _, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                });
                Ok(None)
            }
        })
        .build();

    root.get(&a).unwrap();
    let setter = handle.lock().unwrap().clone().unwrap();
    setter.set(5).unwrap();
    assert_eq!(*root.get(&a).unwrap(), 5);
    assert_eq!(seen.load(Ordering::SeqCst), 0);

    root.set(&a, 6).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_effect_cleanup_runs_on_release() {
    let root = Root::default();
    let cleanups = Arc::new(AtomicU32::new(0));
    let runs = Arc::new(AtomicU32::new(0));
    let a = Atom::builder("a", 0i32)
        .retained_by(RetainedBy::Components)
        .effect({
            let cleanups = cleanups.clone();
            let runs = runs.clone();
            move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                let cleanups = cleanups.clone();
                Ok(Some(Box::new(move || {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                })))
            }
        })
        .build();

    let subscription = root.subscribe(&a, |_| {});
    root.set(&a, 3).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    subscription.release();
    root.sweep();
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    // Released atoms start over from their default.
    assert_eq!(*root.get(&a).unwrap(), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_family_effects_see_their_param() {
    let root = Root::default();
    let family: AtomFamily<String, u32> = AtomFamily::new("user", |_| String::new()).effects(|id| {
        let id = *id;
        let effect: AtomEffect<String> =
            Arc::new(move |ctx: &EffectContext<'_, String>| -> Result<Option<Cleanup>, anyhow::Error> {
                ctx.set_self(format!("user #{}", id))?;
                Ok(None)
            });
        vec![effect]
    });

    assert_eq!(*root.get(&family.get(3)).unwrap(), "user #3");
    assert_eq!(*root.get(&family.get(4)).unwrap(), "user #4");
}
