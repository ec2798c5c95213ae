//! Atoms: leaf state cells with a default value.
//!
//! An atom's value lives in the tree state; the node itself only knows its
//! default and how to validate raw values restored by persistence adapters.
//! Atom effects run once per store when the atom is first used there.

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::evaluation::{get_node_loadable, EvalStack};
use crate::error::Error;
use crate::key::{NodeKey, StoreId};
use crate::loadable::{Loadable, Value};
use crate::node::{
    typed_output_eq, Node, NodeKind, OutputEq, PersistenceType, Readable, RetainedBy, Trigger,
    Writable, WriteSet, WriteValue,
};
use crate::state::{Cleanup, TreeState};
use crate::store::{subscribe_to_transactions, Store, StoreRef, Subscription};
use crate::value_interface::set_loadable;

/// Side effect attached to an atom.
///
/// Runs when the atom is first used in a store. May return a cleanup that
/// runs when the atom is released from that store.
pub type AtomEffect<T> =
    Arc<dyn Fn(&EffectContext<'_, T>) -> Result<Option<Cleanup>, anyhow::Error> + Send + Sync>;

/// Turns a raw restored value into a valid one, or rejects it.
pub type Validator<T> = Arc<dyn Fn(&Value) -> Option<T> + Send + Sync>;

/// Called after a commit that changed the atom: `(new, old, is_reset)`.
pub type OnSetHandler = Arc<dyn Fn(&Loadable, &Loadable, bool) + Send + Sync>;

/// A leaf state cell.
///
/// Cheap to clone; clones refer to the same node.
pub struct Atom<T> {
    node: Arc<AtomNode<T>>,
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Atom").field(&self.node.key).finish()
    }
}

impl<T: Send + Sync + 'static> Atom<T> {
    /// Atom with a plain default value.
    pub fn new(key: impl Into<NodeKey>, default: T) -> Self {
        Self::builder(key, default).build()
    }

    /// Builder for an atom with a plain default value.
    pub fn builder(key: impl Into<NodeKey>, default: T) -> AtomBuilder<T> {
        AtomBuilder::new(key.into(), Loadable::with_value(default))
    }

    /// Builder for an atom whose default is computed asynchronously.
    pub fn builder_async<F>(key: impl Into<NodeKey>, default: F) -> AtomBuilder<T>
    where
        F: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
    {
        AtomBuilder::new(
            key.into(),
            Loadable::loading(async move {
                match default.await {
                    Ok(value) => Loadable::with_value(value),
                    Err(error) => Loadable::with_error(error),
                }
            }),
        )
    }

    /// Key of the atom.
    pub fn key(&self) -> &NodeKey {
        &self.node.key
    }
}

impl<T: Send + Sync + 'static> Readable<T> for Atom<T> {
    fn key(&self) -> &NodeKey {
        &self.node.key
    }

    fn node(&self) -> Arc<dyn Node> {
        self.node.clone()
    }
}

impl<T: Send + Sync + 'static> Writable<T> for Atom<T> {}

/// Builder for [`Atom`].
pub struct AtomBuilder<T> {
    key: NodeKey,
    default: Loadable,
    effects: Vec<AtomEffect<T>>,
    persistence: PersistenceType,
    validator: Option<Validator<T>>,
    retained_by: RetainedBy,
    output_eq: Option<OutputEq<T>>,
    restore_from_snapshots: bool,
    delete_on_release: bool,
}

impl<T: Send + Sync + 'static> AtomBuilder<T> {
    fn new(key: NodeKey, default: Loadable) -> Self {
        Self {
            key,
            default,
            effects: Vec::new(),
            persistence: PersistenceType::None,
            validator: None,
            retained_by: RetainedBy::Root,
            output_eq: None,
            restore_from_snapshots: true,
            delete_on_release: false,
        }
    }

    /// Add an effect. Effects run in the order they were added.
    pub fn effect<F>(mut self, effect: F) -> Self
    where
        F: Fn(&EffectContext<'_, T>) -> Result<Option<Cleanup>, anyhow::Error>
            + Send
            + Sync
            + 'static,
    {
        self.effects.push(Arc::new(effect));
        self
    }

    /// Add an already shared effect.
    pub fn shared_effect(mut self, effect: AtomEffect<T>) -> Self {
        self.effects.push(effect);
        self
    }

    /// Tag the atom for persistence adapters.
    pub fn persistence(mut self, persistence: PersistenceType) -> Self {
        self.persistence = persistence;
        self
    }

    /// Validate raw values set with `set_unvalidated_atom_values`.
    ///
    /// Without a validator a raw value is used if it already has type `T`.
    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Option<T> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// What keeps the atom alive. Defaults to [`RetainedBy::Root`].
    pub fn retained_by(mut self, retained_by: RetainedBy) -> Self {
        self.retained_by = retained_by;
        self
    }

    /// Treat writes equal to the stored value as no-ops.
    pub fn output_eq(mut self, eq: OutputEq<T>) -> Self {
        self.output_eq = Some(eq);
        self
    }

    /// Whether `goto_snapshot` restores this atom. Defaults to true.
    pub fn restore_from_snapshots(mut self, restore: bool) -> Self {
        self.restore_from_snapshots = restore;
        self
    }

    pub(crate) fn delete_on_release(mut self, delete: bool) -> Self {
        self.delete_on_release = delete;
        self
    }

    /// Build the atom.
    pub fn build(self) -> Atom<T> {
        let node = Arc::new_cyclic(|me| AtomNode {
            key: self.key,
            me: me.clone(),
            default: self.default,
            effects: self.effects,
            persistence: self.persistence,
            validator: self.validator,
            retained_by: self.retained_by,
            output_eq: self.output_eq,
            restore_from_snapshots: self.restore_from_snapshots,
            delete_on_release: self.delete_on_release,
            validated: Mutex::new(None),
        });
        Atom { node }
    }
}

pub(crate) struct AtomNode<T> {
    key: NodeKey,
    me: Weak<AtomNode<T>>,
    default: Loadable,
    effects: Vec<AtomEffect<T>>,
    persistence: PersistenceType,
    validator: Option<Validator<T>>,
    retained_by: RetainedBy,
    output_eq: Option<OutputEq<T>>,
    restore_from_snapshots: bool,
    delete_on_release: bool,
    // Last raw value and its validated loadable.
    validated: Mutex<Option<(Value, Loadable)>>,
}

impl<T: Send + Sync + 'static> AtomNode<T> {
    fn read(&self, tree: &TreeState) -> Loadable {
        if let Some(stored) = tree.atom_value(&self.key) {
            return stored.settled();
        }
        if let Some(raw) = tree.non_validated(&self.key) {
            if let Some(validated) = self.validate(raw) {
                return validated;
            }
        }
        self.default.settled()
    }

    fn validate(&self, raw: Value) -> Option<Loadable> {
        if let Some((cached_raw, cached)) = &*self.validated.lock() {
            if Arc::ptr_eq(cached_raw, &raw) {
                return Some(cached.clone());
            }
        }
        let validated = match &self.validator {
            Some(validator) => Loadable::with_value(validator(&raw)?),
            None => {
                raw.clone().downcast::<T>().ok()?;
                Loadable::Value(raw.clone())
            }
        };
        *self.validated.lock() = Some((raw, validated.clone()));
        Some(validated)
    }

    fn type_check(&self, loadable: &Loadable) -> Result<(), Error> {
        match loadable.contents() {
            Some(value) if value.downcast_ref::<T>().is_none() => Err(Error::TypeMismatch {
                key: self.key.clone(),
                expected: type_name::<T>(),
            }),
            _ => Ok(()),
        }
    }

    fn run_effects(self: &Arc<Self>, store: &StoreRef, tree: &Arc<TreeState>, trigger: Trigger) -> Cleanup {
        let shared = Arc::new(Mutex::new(EffectState {
            during_init: true,
            init_value: None,
            pending_set_self: None,
        }));
        let mut cleanups: Vec<Cleanup> = Vec::new();
        let mut subscriptions: Vec<Subscription> = Vec::new();

        for (index, effect) in self.effects.iter().enumerate() {
            let context = EffectContext {
                handle: EffectHandle {
                    store: Arc::downgrade(store),
                    node: self.clone(),
                    index,
                    shared: shared.clone(),
                },
                store,
                tree,
                trigger,
                subscriptions: Mutex::new(Vec::new()),
            };
            match effect(&context) {
                Ok(Some(cleanup)) => cleanups.push(cleanup),
                Ok(None) => {}
                Err(error) => {
                    tracing::debug!(key = %self.key, error = %error, "atom effect failed");
                    shared.lock().init_value = Some(WriteValue::Set(Loadable::with_error(error)));
                }
            }
            subscriptions.extend(context.subscriptions.into_inner());
        }

        let init_value = {
            let mut shared = shared.lock();
            shared.during_init = false;
            shared.init_value.take()
        };
        if let Some(WriteValue::Set(loadable)) = init_value {
            tree.set_atom_value(self.key.clone(), loadable.clone());
            let next = store.get_state().next_tree.clone();
            if let Some(next) = next.filter(|next| !Arc::ptr_eq(next, tree)) {
                next.set_atom_value(self.key.clone(), loadable);
            }
        }

        Box::new(move || {
            drop(subscriptions);
            for cleanup in cleanups {
                cleanup();
            }
        })
    }
}

impl<T: Send + Sync + 'static> Node for AtomNode<T> {
    fn key(&self) -> &NodeKey {
        &self.key
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Atom
    }

    fn get(&self, _store: &StoreRef, tree: &Arc<TreeState>, _stack: &EvalStack) -> Result<Loadable, Error> {
        Ok(self.read(tree))
    }

    fn peek(&self, _store: &StoreRef, tree: &Arc<TreeState>) -> Option<Loadable> {
        Some(self.read(tree))
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn set(
        &self,
        _store: &StoreRef,
        tree: &Arc<TreeState>,
        value: WriteValue,
        _stack: &EvalStack,
    ) -> Result<WriteSet, Error> {
        match &value {
            WriteValue::Set(loadable) => {
                self.type_check(loadable)?;
                if let Some(existing) = tree.atom_value(&self.key) {
                    let unchanged = existing.is_same(loadable)
                        || matches!(
                            (existing.contents(), loadable.contents()),
                            (Some(a), Some(b)) if self.output_eq(a, b)
                        );
                    if unchanged && !tree.has_non_validated(&self.key) {
                        return Ok(WriteSet::default());
                    }
                }
            }
            WriteValue::Reset => {
                if !tree.has_atom_value(&self.key) && !tree.has_non_validated(&self.key) {
                    return Ok(WriteSet::default());
                }
            }
        }
        let mut writes = WriteSet::default();
        writes.insert(self.key.clone(), value);
        Ok(writes)
    }

    fn init(&self, store: &StoreRef, tree: &Arc<TreeState>, trigger: Trigger) -> Cleanup {
        store.get_state().known_atoms.insert(self.key.clone());
        match self.me.upgrade() {
            Some(me) if !self.effects.is_empty() => me.run_effects(store, tree, trigger),
            _ => Box::new(|| {}),
        }
    }

    fn invalidate(&self, _tree: &TreeState) {
        *self.validated.lock() = None;
    }

    fn retained_by(&self) -> RetainedBy {
        self.retained_by.clone()
    }

    fn should_restore_from_snapshots(&self) -> bool {
        self.restore_from_snapshots
    }

    fn persistence(&self) -> PersistenceType {
        self.persistence
    }

    fn should_delete_config_on_release(&self) -> bool {
        self.delete_on_release
    }

    fn output_eq(&self, a: &Value, b: &Value) -> bool {
        typed_output_eq(self.output_eq, a, b)
    }
}

struct EffectState {
    during_init: bool,
    init_value: Option<WriteValue>,
    pending_set_self: Option<PendingSet>,
}

// A write made by one effect that its own on_set handler must not see.
struct PendingSet {
    effect: usize,
    value: Option<Loadable>,
}

/// Handle an effect can keep to set its atom later, e.g. from a callback.
pub struct EffectHandle<T> {
    store: Weak<dyn Store>,
    node: Arc<AtomNode<T>>,
    index: usize,
    shared: Arc<Mutex<EffectState>>,
}

impl<T> Clone for EffectHandle<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            node: self.node.clone(),
            index: self.index,
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> EffectHandle<T> {
    /// Set the atom.
    ///
    /// During initialization this sets the atom's initial value in the store
    /// without a commit. Afterwards it is an ordinary write.
    pub fn set(&self, value: T) -> Result<(), Error> {
        self.write(WriteValue::value(value))
    }

    /// Set the atom to a loadable, e.g. a pending one.
    pub fn set_loadable(&self, loadable: Loadable) -> Result<(), Error> {
        self.write(WriteValue::Set(loadable))
    }

    /// Reset the atom to its default.
    pub fn reset(&self) -> Result<(), Error> {
        self.write(WriteValue::Reset)
    }

    fn write(&self, value: WriteValue) -> Result<(), Error> {
        if let WriteValue::Set(loadable) = &value {
            self.node.type_check(loadable)?;
        }
        {
            let mut shared = self.shared.lock();
            if shared.during_init {
                shared.init_value = Some(value);
                return Ok(());
            }
            shared.pending_set_self = Some(PendingSet {
                effect: self.index,
                value: match &value {
                    WriteValue::Set(loadable) => Some(loadable.clone()),
                    WriteValue::Reset => None,
                },
            });
        }
        match self.store.upgrade() {
            Some(store) => set_loadable(&store, &self.node.key, value),
            None => Ok(()),
        }
    }
}

/// What an atom effect sees while it runs.
pub struct EffectContext<'a, T> {
    handle: EffectHandle<T>,
    store: &'a StoreRef,
    tree: &'a Arc<TreeState>,
    trigger: Trigger,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl<T: Send + Sync + 'static> EffectContext<'_, T> {
    /// Key of the atom.
    pub fn key(&self) -> &NodeKey {
        &self.handle.node.key
    }

    /// Store the atom is being initialized in.
    pub fn store_id(&self) -> StoreId {
        self.store.store_id()
    }

    /// Store this store was cloned from, if any.
    pub fn parent_store_id(&self) -> Option<StoreId> {
        self.store.parent_store_id()
    }

    /// Whether the first access was a read or a write.
    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// See [`EffectHandle::set`].
    pub fn set_self(&self, value: T) -> Result<(), Error> {
        self.handle.set(value)
    }

    /// See [`EffectHandle::set_loadable`].
    pub fn set_self_loadable(&self, loadable: Loadable) -> Result<(), Error> {
        self.handle.set_loadable(loadable)
    }

    /// See [`EffectHandle::reset`].
    pub fn reset_self(&self) -> Result<(), Error> {
        self.handle.reset()
    }

    /// A handle for setting the atom after the effect returned.
    pub fn setter(&self) -> EffectHandle<T> {
        self.handle.clone()
    }

    /// Current loadable of another node in the tree being initialized.
    pub fn get_loadable<R>(&self, node: &impl Readable<R>) -> Result<Loadable, Error> {
        self.store.config().registry().register(node.node());
        Ok(get_node_loadable(self.store, self.tree, node.key(), &EvalStack::new())?.settled())
    }

    /// Call `handler` after every commit that changed this atom.
    ///
    /// Writes made through this effect's own handle are not reported back to
    /// it. The subscription ends when the atom is released.
    pub fn on_set<F>(&self, handler: F)
    where
        F: Fn(&Loadable, &Loadable, bool) + Send + Sync + 'static,
    {
        let handler: OnSetHandler = Arc::new(handler);
        let node = self.handle.node.clone();
        let shared = self.handle.shared.clone();
        let index = self.handle.index;
        let subscription = subscribe_to_transactions(
            self.store,
            Arc::new(move |store: &StoreRef| {
                let (current, previous) = {
                    let state = store.get_state();
                    let previous = state
                        .previous_tree
                        .clone()
                        .unwrap_or_else(|| state.current_tree.clone());
                    (state.current_tree.clone(), previous)
                };
                let new_value = node.read(&current);
                let old_value = node.read(&previous);
                if new_value.is_same(&old_value) {
                    return;
                }
                let stored = current.atom_value(&node.key);
                {
                    let mut shared = shared.lock();
                    if let Some(pending) = &shared.pending_set_self {
                        if pending.effect == index {
                            let own_write = match (&pending.value, &stored) {
                                (Some(written), Some(stored)) => written.is_same(stored),
                                (None, None) => true,
                                _ => false,
                            };
                            if own_write {
                                shared.pending_set_self = None;
                                return;
                            }
                        }
                    }
                }
                handler(&new_value, &old_value, stored.is_none());
            }),
            Some(self.handle.node.key.clone()),
        );
        self.subscriptions.lock().push(subscription);
    }
}
