//! Parameterized atoms and selectors.
//!
//! A family maps each parameter to its own node, keyed by
//! [`NodeKey::family`]. Members are created on first use, remembered by the
//! family, and unregister themselves when a store releases them.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::Mutex;

use crate::atom::{Atom, AtomEffect};
use crate::error::EvalError;
use crate::key::NodeKey;
use crate::node::{OutputEq, RetainedBy};
use crate::selector::{CachePolicy, GetContext, Selector, SetContext, SetValue};

/// Bounds of a family parameter.
pub trait FamilyParam: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static {}

impl<P: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static> FamilyParam for P {}

type DefaultFn<T, P> = Arc<dyn Fn(&P) -> T + Send + Sync>;
type EffectsFn<T, P> = Arc<dyn Fn(&P) -> Vec<AtomEffect<T>> + Send + Sync>;

/// Atoms keyed by a parameter.
pub struct AtomFamily<T, P> {
    key: NodeKey,
    default: DefaultFn<T, P>,
    effects: Option<EffectsFn<T, P>>,
    retained_by: RetainedBy,
    output_eq: Option<OutputEq<T>>,
    members: Mutex<HashMap<P, Atom<T>, RandomState>>,
}

impl<T: Send + Sync + 'static, P: FamilyParam> AtomFamily<T, P> {
    /// Family whose members default to `default(param)`.
    pub fn new<F>(key: impl Into<NodeKey>, default: F) -> Self
    where
        F: Fn(&P) -> T + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            default: Arc::new(default),
            effects: None,
            retained_by: RetainedBy::Root,
            output_eq: None,
            members: Mutex::new(HashMap::default()),
        }
    }

    /// Effects of each member, derived from its parameter.
    pub fn effects<F>(mut self, effects: F) -> Self
    where
        F: Fn(&P) -> Vec<AtomEffect<T>> + Send + Sync + 'static,
    {
        self.effects = Some(Arc::new(effects));
        self
    }

    /// What keeps members alive.
    pub fn retained_by(mut self, retained_by: RetainedBy) -> Self {
        self.retained_by = retained_by;
        self
    }

    /// Equality used for member writes.
    pub fn output_eq(mut self, eq: OutputEq<T>) -> Self {
        self.output_eq = Some(eq);
        self
    }

    /// Base key of the family.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// The member for `param`.
    pub fn get(&self, param: P) -> Atom<T> {
        let mut members = self.members.lock();
        if let Some(atom) = members.get(&param) {
            return atom.clone();
        }
        let mut builder = Atom::builder(NodeKey::family(&self.key, &param), (self.default)(&param))
            .retained_by(self.retained_by.clone())
            .delete_on_release(true);
        if let Some(eq) = self.output_eq {
            builder = builder.output_eq(eq);
        }
        if let Some(effects) = &self.effects {
            for effect in effects(&param) {
                builder = builder.shared_effect(effect);
            }
        }
        let atom = builder.build();
        members.insert(param, atom.clone());
        atom
    }

    /// Number of members created so far.
    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    /// Returns true if no member was created yet.
    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

impl<T, P> fmt::Debug for AtomFamily<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomFamily").field("key", &self.key).finish_non_exhaustive()
    }
}

type FamilyGetter<T, P> = Arc<dyn Fn(&P, &GetContext<'_>) -> Result<T, EvalError> + Send + Sync>;
type FamilySetter<T, P> =
    Arc<dyn Fn(&P, &SetContext<'_>, SetValue<T>) -> Result<(), EvalError> + Send + Sync>;

/// Selectors keyed by a parameter.
pub struct SelectorFamily<T, P> {
    key: NodeKey,
    get: FamilyGetter<T, P>,
    set: Option<FamilySetter<T, P>>,
    output_eq: Option<OutputEq<T>>,
    cache_policy: CachePolicy,
    retained_by: RetainedBy,
    members: Mutex<HashMap<P, Selector<T>, RandomState>>,
}

impl<T: Send + Sync + 'static, P: FamilyParam> SelectorFamily<T, P> {
    /// Family whose members compute `get(param, ctx)`.
    pub fn new<F>(key: impl Into<NodeKey>, get: F) -> Self
    where
        F: Fn(&P, &GetContext<'_>) -> Result<T, EvalError> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            get: Arc::new(get),
            set: None,
            output_eq: None,
            cache_policy: CachePolicy::default(),
            retained_by: RetainedBy::Root,
            members: Mutex::new(HashMap::default()),
        }
    }

    /// Make members writable.
    pub fn set<F>(mut self, set: F) -> Self
    where
        F: Fn(&P, &SetContext<'_>, SetValue<T>) -> Result<(), EvalError> + Send + Sync + 'static,
    {
        self.set = Some(Arc::new(set));
        self
    }

    /// Early cutoff for member results.
    pub fn output_eq(mut self, eq: OutputEq<T>) -> Self {
        self.output_eq = Some(eq);
        self
    }

    /// Cache policy of each member.
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// What keeps members alive.
    pub fn retained_by(mut self, retained_by: RetainedBy) -> Self {
        self.retained_by = retained_by;
        self
    }

    /// Base key of the family.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// The member for `param`.
    pub fn get(&self, param: P) -> Selector<T> {
        let mut members = self.members.lock();
        if let Some(selector) = members.get(&param) {
            return selector.clone();
        }
        let get = self.get.clone();
        let get_param = param.clone();
        let mut builder = Selector::builder(NodeKey::family(&self.key, &param), move |ctx| {
            get(&get_param, ctx)
        })
        .cache_policy(self.cache_policy)
        .retained_by(self.retained_by.clone())
        .delete_on_release(true);
        if let Some(set) = &self.set {
            let set = set.clone();
            let set_param = param.clone();
            builder = builder.set(move |ctx, value| set(&set_param, ctx, value));
        }
        if let Some(eq) = self.output_eq {
            builder = builder.output_eq(eq);
        }
        let selector = builder.build();
        members.insert(param, selector.clone());
        selector
    }

    /// Number of members created so far.
    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    /// Returns true if no member was created yet.
    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

impl<T, P> fmt::Debug for SelectorFamily<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorFamily")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
