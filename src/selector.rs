//! Selectors: derived nodes.
//!
//! A selector's getter reads other nodes through a [`GetContext`], which
//! records every dependency it touches. Results are cached by the values of
//! those dependencies, so a read only re-runs the getter when something it
//! actually read has changed. The cache is keyed by values, not by tree
//! version, which lets snapshots and the live store share hits.

use std::any::type_name;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::RandomState;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::evaluation::{get_node_loadable, peek_node_loadable, set_node_value, EvalStack};
use crate::error::{EvalError, Error};
use crate::graph::save_deps_to_store;
use crate::key::NodeKey;
use crate::loadable::{Loadable, Pending, Value};
use crate::node::{
    typed_output_eq, Node, NodeKind, OutputEq, Readable, RetainedBy, Trigger, Writable, WriteSet,
    WriteValue,
};
use crate::state::{Cleanup, TreeState};
use crate::store::StoreRef;
use crate::tracer::EvaluationResult;
use crate::value_interface::mark_modified;

/// Synchronous selector body.
pub type Getter<T> = Arc<dyn Fn(&GetContext<'_>) -> Result<T, EvalError> + Send + Sync>;

/// Asynchronous selector body.
///
/// Dependencies are read synchronously through the context; the returned
/// future computes the value from them.
pub type AsyncGetter<T> = Arc<
    dyn Fn(&GetContext<'_>) -> Result<BoxFuture<'static, Result<T, anyhow::Error>>, EvalError>
        + Send
        + Sync,
>;

/// Set handler of a writable selector.
pub type SetHandler<T> = Arc<dyn Fn(&SetContext<'_>, SetValue<T>) -> Result<(), EvalError> + Send + Sync>;

/// Value passed to a set handler.
#[derive(Debug)]
pub enum SetValue<T> {
    /// A new value.
    Value(Arc<T>),
    /// Reset request.
    Reset,
}

impl<T> Clone for SetValue<T> {
    fn clone(&self) -> Self {
        match self {
            SetValue::Value(value) => SetValue::Value(value.clone()),
            SetValue::Reset => SetValue::Reset,
        }
    }
}

/// How many dependency combinations a selector remembers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Every combination ever seen.
    #[default]
    KeepAll,
    /// Only the latest combination.
    MostRecent,
    /// The `n` most recently used combinations.
    Lru(usize),
}

enum GetFn<T> {
    Sync(Getter<T>),
    Async(AsyncGetter<T>),
}

impl<T> Clone for GetFn<T> {
    fn clone(&self) -> Self {
        match self {
            GetFn::Sync(get) => GetFn::Sync(get.clone()),
            GetFn::Async(get) => GetFn::Async(get.clone()),
        }
    }
}

/// A derived node.
///
/// Cheap to clone; clones refer to the same node and share its cache.
pub struct Selector<T> {
    node: Arc<SelectorNode<T>>,
}

impl<T> Clone for Selector<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T> fmt::Debug for Selector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Selector").field(&self.node.key).finish()
    }
}

impl<T: Send + Sync + 'static> Selector<T> {
    /// Read-only selector.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let count = Atom::new("count", 0);
    /// let doubled = Selector::new("doubled", {
    ///     let count = count.clone();
    ///     move |ctx| Ok(*ctx.get(&count)? * 2)
    /// });
    /// ```
    pub fn new<F>(key: impl Into<NodeKey>, get: F) -> Self
    where
        F: Fn(&GetContext<'_>) -> Result<T, EvalError> + Send + Sync + 'static,
    {
        Self::builder(key, get).build()
    }

    /// Builder for a selector with a synchronous getter.
    pub fn builder<F>(key: impl Into<NodeKey>, get: F) -> SelectorBuilder<T>
    where
        F: Fn(&GetContext<'_>) -> Result<T, EvalError> + Send + Sync + 'static,
    {
        SelectorBuilder::new(key.into(), GetFn::Sync(Arc::new(get)))
    }

    /// Builder for a selector with an asynchronous getter.
    pub fn builder_async<F>(key: impl Into<NodeKey>, get: F) -> SelectorBuilder<T>
    where
        F: Fn(&GetContext<'_>) -> Result<BoxFuture<'static, Result<T, anyhow::Error>>, EvalError>
            + Send
            + Sync
            + 'static,
    {
        SelectorBuilder::new(key.into(), GetFn::Async(Arc::new(get)))
    }

    /// Key of the selector.
    pub fn key(&self) -> &NodeKey {
        &self.node.key
    }

    /// Number of cached dependency combinations.
    pub fn cache_len(&self) -> usize {
        self.node.cache.lock().len()
    }
}

impl<T: Send + Sync + 'static> Readable<T> for Selector<T> {
    fn key(&self) -> &NodeKey {
        &self.node.key
    }

    fn node(&self) -> Arc<dyn Node> {
        self.node.clone()
    }
}

impl<T: Send + Sync + 'static> Writable<T> for Selector<T> {}

/// Builder for [`Selector`].
pub struct SelectorBuilder<T> {
    key: NodeKey,
    get: GetFn<T>,
    set: Option<SetHandler<T>>,
    output_eq: Option<OutputEq<T>>,
    cache_policy: CachePolicy,
    retained_by: RetainedBy,
    delete_on_release: bool,
}

impl<T: Send + Sync + 'static> SelectorBuilder<T> {
    fn new(key: NodeKey, get: GetFn<T>) -> Self {
        Self {
            key,
            get,
            set: None,
            output_eq: None,
            cache_policy: CachePolicy::default(),
            retained_by: RetainedBy::Root,
            delete_on_release: false,
        }
    }

    /// Make the selector writable.
    pub fn set<F>(mut self, set: F) -> Self
    where
        F: Fn(&SetContext<'_>, SetValue<T>) -> Result<(), EvalError> + Send + Sync + 'static,
    {
        self.set = Some(Arc::new(set));
        self
    }

    /// Early cutoff: a result equal to the previous one keeps its identity.
    pub fn output_eq(mut self, eq: OutputEq<T>) -> Self {
        self.output_eq = Some(eq);
        self
    }

    /// Cache policy. Defaults to [`CachePolicy::KeepAll`].
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// What keeps the selector alive. Defaults to [`RetainedBy::Root`].
    pub fn retained_by(mut self, retained_by: RetainedBy) -> Self {
        self.retained_by = retained_by;
        self
    }

    pub(crate) fn delete_on_release(mut self, delete: bool) -> Self {
        self.delete_on_release = delete;
        self
    }

    /// Build the selector.
    pub fn build(self) -> Selector<T> {
        let node = Arc::new_cyclic(|me| SelectorNode {
            key: self.key,
            me: me.clone(),
            get: self.get,
            set: self.set,
            output_eq: self.output_eq,
            cache_policy: self.cache_policy,
            retained_by: self.retained_by,
            delete_on_release: self.delete_on_release,
            cache: Mutex::new(VecDeque::new()),
            executions: AtomicU64::new(0),
        });
        Selector { node }
    }
}

struct CacheEntry {
    deps: Vec<(NodeKey, Loadable)>,
    loadable: Loadable,
}

pub(crate) struct SelectorNode<T> {
    key: NodeKey,
    me: Weak<SelectorNode<T>>,
    get: GetFn<T>,
    set: Option<SetHandler<T>>,
    output_eq: Option<OutputEq<T>>,
    cache_policy: CachePolicy,
    retained_by: RetainedBy,
    delete_on_release: bool,
    // Most recently used first.
    cache: Mutex<VecDeque<Arc<CacheEntry>>>,
    executions: AtomicU64,
}

enum Evaluated<T> {
    Value(T),
    Future(BoxFuture<'static, Result<T, anyhow::Error>>),
}

impl<T: Send + Sync + 'static> SelectorNode<T> {
    fn lookup(
        &self,
        store: &StoreRef,
        tree: &Arc<TreeState>,
        stack: &EvalStack,
    ) -> Result<Option<Arc<CacheEntry>>, Error> {
        let entries: Vec<Arc<CacheEntry>> = self.cache.lock().iter().cloned().collect();
        if entries.is_empty() {
            return Ok(None);
        }
        let registry = store.config().registry();
        let mut seen: IndexMap<NodeKey, Option<Loadable>, RandomState> = IndexMap::default();

        'entries: for entry in entries {
            for (key, recorded) in &entry.deps {
                if !seen.contains_key(key) {
                    let current = match get_node_loadable(store, tree, key, stack) {
                        Ok(loadable) => Some(loadable.settled()),
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(_) => None,
                    };
                    seen.insert(key.clone(), current);
                }
                let Some(Some(current)) = seen.get(key) else {
                    continue 'entries;
                };
                if !same_dep(registry.get_maybe(key).as_deref(), recorded, current) {
                    continue 'entries;
                }
            }
            return Ok(Some(entry));
        }
        Ok(None)
    }

    fn evaluate(&self, store: &StoreRef, tree: &Arc<TreeState>, stack: &EvalStack) -> Result<Loadable, Error> {
        let context = GetContext {
            store,
            tree,
            stack,
            deps: RefCell::new(IndexMap::default()),
            fault: RefCell::new(None),
        };
        let result = match &self.get {
            GetFn::Sync(get) => get(&context).map(Evaluated::Value),
            GetFn::Async(get) => get(&context).map(Evaluated::Future),
        };
        if let Some(fault) = context.fault.take() {
            return Err(fault);
        }
        let deps = context.deps.into_inner();
        save_deps_to_store(&self.key, deps.keys().cloned().collect(), store.as_ref(), tree.version);

        let loadable = match result {
            Ok(Evaluated::Value(value)) => Loadable::Value(self.intern(value)),
            Ok(Evaluated::Future(future)) => self.resolve_async(store, future),
            Err(EvalError::User(error)) => Loadable::Error(error),
            Err(EvalError::Suspend { key, pending }) => {
                tracing::trace!(selector = %self.key, waiting_for = %key, "selector suspended");
                self.resume_after(store, tree, pending)
            }
            Err(EvalError::Cycle { path }) => return Err(Error::Cycle { path }),
        };

        let result = match &loadable {
            Loadable::Value(_) => EvaluationResult::Value,
            Loadable::Loading(_) => EvaluationResult::Loading,
            Loadable::Error(error) => EvaluationResult::Error {
                message: error.to_string(),
            },
        };
        store
            .config()
            .tracer()
            .on_node_evaluated(&self.key, tree.version, &result);

        self.insert(CacheEntry {
            deps: deps.into_iter().collect(),
            loadable: loadable.clone(),
        });
        Ok(loadable)
    }

    // Reuse the most recent equal value so downstream caches keep hitting.
    fn intern(&self, value: T) -> Value {
        let value: Value = Arc::new(value);
        if self.output_eq.is_none() {
            return value;
        }
        let latest = self
            .cache
            .lock()
            .iter()
            .find_map(|entry| entry.loadable.settled().contents().cloned());
        match latest {
            Some(latest) if typed_output_eq(self.output_eq, &latest, &value) => latest,
            _ => value,
        }
    }

    fn insert(&self, entry: CacheEntry) {
        let mut cache = self.cache.lock();
        match self.cache_policy {
            CachePolicy::KeepAll => {}
            CachePolicy::MostRecent => cache.clear(),
            CachePolicy::Lru(capacity) => cache.truncate(capacity.max(1) - 1),
        }
        cache.push_front(Arc::new(entry));
    }

    fn touch(&self, entry: &Arc<CacheEntry>) {
        if !matches!(self.cache_policy, CachePolicy::Lru(_)) {
            return;
        }
        let mut cache = self.cache.lock();
        if let Some(index) = cache.iter().position(|e| Arc::ptr_eq(e, entry)) {
            if let Some(entry) = cache.remove(index) {
                cache.push_front(entry);
            }
        }
    }

    fn resolve_async(
        &self,
        store: &StoreRef,
        future: BoxFuture<'static, Result<T, anyhow::Error>>,
    ) -> Loadable {
        let me = self.me.clone();
        let weak_store = Arc::downgrade(store);
        let execution = self.executions.fetch_add(1, Ordering::Relaxed);
        let key = self.key.clone();
        Loadable::loading(async move {
            let settled = match future.await {
                Ok(value) => match me.upgrade() {
                    Some(me) => Loadable::Value(me.intern(value)),
                    None => Loadable::with_value(value),
                },
                Err(error) => Loadable::with_error(error),
            };
            tracing::trace!(selector = %key, execution, "async selector settled");
            notify_resolved(weak_store.upgrade(), &key);
            settled
        })
    }

    // A dependency is loading: wait for it, then evaluate again.
    fn resume_after(&self, store: &StoreRef, tree: &Arc<TreeState>, pending: Pending) -> Loadable {
        let me = self.me.clone();
        let weak_store = Arc::downgrade(store);
        let tree = tree.clone();
        let key = self.key.clone();
        Loadable::loading(async move {
            pending.await;
            let (Some(me), Some(store)) = (me.upgrade(), weak_store.upgrade()) else {
                return Loadable::with_error(anyhow::anyhow!("store of {} was dropped", key));
            };
            let tree = {
                let state = store.get_state();
                if state.is_live_version(tree.version) {
                    tree
                } else {
                    state.current_tree.clone()
                }
            };
            let loadable = match Node::get(me.as_ref(), &store, &tree, &EvalStack::new()) {
                Ok(loadable) => loadable,
                Err(err) => Loadable::with_error(err),
            };
            let settled = settle(loadable).await;
            notify_resolved(Some(store), &key);
            settled
        })
    }
}

async fn settle(mut loadable: Loadable) -> Loadable {
    while let Loadable::Loading(pending) = loadable {
        loadable = pending.await;
    }
    loadable
}

// Let subscribers of a live store know a pending selector settled.
fn notify_resolved(store: Option<StoreRef>, key: &NodeKey) {
    let Some(store) = store else {
        return;
    };
    if !store.supports_transactions() {
        return;
    }
    if let Err(err) = mark_modified(&store, key) {
        tracing::debug!(selector = %key, error = %err, "could not report settled selector");
    }
}

fn same_dep(node: Option<&dyn Node>, recorded: &Loadable, current: &Loadable) -> bool {
    if recorded.is_same(current) {
        return true;
    }
    match (node, recorded.contents(), current.contents()) {
        (Some(node), Some(a), Some(b)) => node.output_eq(a, b),
        _ => false,
    }
}

impl<T: Send + Sync + 'static> Node for SelectorNode<T> {
    fn key(&self) -> &NodeKey {
        &self.key
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Selector
    }

    fn get(&self, store: &StoreRef, tree: &Arc<TreeState>, stack: &EvalStack) -> Result<Loadable, Error> {
        let _frame = stack.enter(&self.key)?;
        if let Some(entry) = self.lookup(store, tree, stack)? {
            let deps = entry.deps.iter().map(|(key, _)| key.clone()).collect();
            save_deps_to_store(&self.key, deps, store.as_ref(), tree.version);
            store.config().tracer().on_cache_hit(&self.key, tree.version);
            self.touch(&entry);
            return Ok(entry.loadable.settled());
        }
        self.evaluate(store, tree, stack)
    }

    fn peek(&self, store: &StoreRef, tree: &Arc<TreeState>) -> Option<Loadable> {
        let entries: Vec<Arc<CacheEntry>> = self.cache.lock().iter().cloned().collect();
        let registry = store.config().registry();
        'entries: for entry in entries {
            for (key, recorded) in &entry.deps {
                let Some(current) = peek_node_loadable(store, tree, key) else {
                    continue 'entries;
                };
                if !same_dep(registry.get_maybe(key).as_deref(), recorded, &current.settled()) {
                    continue 'entries;
                }
            }
            return Some(entry.loadable.settled());
        }
        None
    }

    fn is_writable(&self) -> bool {
        self.set.is_some()
    }

    fn set(
        &self,
        store: &StoreRef,
        tree: &Arc<TreeState>,
        value: WriteValue,
        stack: &EvalStack,
    ) -> Result<WriteSet, Error> {
        let Some(handler) = &self.set else {
            return Err(Error::ReadOnly(self.key.clone()));
        };
        let value = match value {
            WriteValue::Reset => SetValue::Reset,
            WriteValue::Set(Loadable::Value(value)) => {
                SetValue::Value(value.downcast::<T>().map_err(|_| Error::TypeMismatch {
                    key: self.key.clone(),
                    expected: type_name::<T>(),
                })?)
            }
            WriteValue::Set(Loadable::Error(error)) => {
                return Err(Error::Evaluation {
                    key: self.key.clone(),
                    error,
                })
            }
            WriteValue::Set(Loadable::Loading(_)) => return Err(Error::NotReady(self.key.clone())),
        };

        let _frame = stack.enter(&self.key)?;
        let context = SetContext {
            store,
            tree,
            stack,
            writes: RefCell::new(WriteSet::default()),
        };
        match handler(&context, value) {
            Ok(()) => Ok(context.writes.into_inner()),
            Err(EvalError::User(error)) => Err(Error::Evaluation {
                key: self.key.clone(),
                error,
            }),
            Err(EvalError::Suspend { key, .. }) => Err(Error::NotReady(key)),
            Err(EvalError::Cycle { path }) => Err(Error::Cycle { path }),
        }
    }

    fn init(&self, store: &StoreRef, _tree: &Arc<TreeState>, _trigger: Trigger) -> Cleanup {
        store.get_state().known_selectors.insert(self.key.clone());
        let weak = Arc::downgrade(store);
        let key = self.key.clone();
        Box::new(move || {
            if let Some(store) = weak.upgrade() {
                store.get_state().known_selectors.remove(&key);
            }
        })
    }

    fn clear_cache(&self, _store: &StoreRef, _tree: &Arc<TreeState>) {
        self.cache.lock().clear();
    }

    fn retained_by(&self) -> RetainedBy {
        self.retained_by.clone()
    }

    fn should_delete_config_on_release(&self) -> bool {
        self.delete_on_release
    }

    fn output_eq(&self, a: &Value, b: &Value) -> bool {
        typed_output_eq(self.output_eq, a, b)
    }
}

/// What a selector getter reads through.
///
/// Every node read is recorded as a dependency of the selector.
pub struct GetContext<'a> {
    store: &'a StoreRef,
    tree: &'a Arc<TreeState>,
    stack: &'a EvalStack,
    deps: RefCell<IndexMap<NodeKey, Loadable, RandomState>>,
    fault: RefCell<Option<Error>>,
}

impl GetContext<'_> {
    /// Value of `node`.
    ///
    /// A loading node suspends the selector and an errored one fails it; both
    /// propagate with `?`.
    pub fn get<R: Send + Sync + 'static>(&self, node: &impl Readable<R>) -> Result<Arc<R>, EvalError> {
        match self.get_loadable(node)? {
            Loadable::Value(value) => value.downcast::<R>().map_err(|_| {
                EvalError::from_fault(Error::TypeMismatch {
                    key: node.key().clone(),
                    expected: type_name::<R>(),
                })
            }),
            Loadable::Error(error) => Err(EvalError::User(error)),
            Loadable::Loading(pending) => Err(EvalError::Suspend {
                key: node.key().clone(),
                pending,
            }),
        }
    }

    /// Loadable of `node`, without failing on loading or errored values.
    pub fn get_loadable<R>(&self, node: &impl Readable<R>) -> Result<Loadable, EvalError> {
        let key = node.key();
        self.store.config().registry().register(node.node());
        match get_node_loadable(self.store, self.tree, key, self.stack) {
            Ok(loadable) => {
                let loadable = loadable.settled();
                self.deps.borrow_mut().insert(key.clone(), loadable.clone());
                Ok(loadable)
            }
            Err(err) => {
                let eval_error = EvalError::from_fault(err.clone());
                if err.is_fatal() {
                    self.fault.borrow_mut().get_or_insert(err);
                }
                Err(eval_error)
            }
        }
    }

    /// Id of the tree being evaluated.
    pub fn state_id(&self) -> crate::key::StateId {
        self.tree.state_id
    }
}

/// What a selector set handler reads and writes through.
///
/// Reads see the tree as it was before the write; writes are collected and
/// applied together once the handler returns.
pub struct SetContext<'a> {
    store: &'a StoreRef,
    tree: &'a Arc<TreeState>,
    stack: &'a EvalStack,
    writes: RefCell<WriteSet>,
}

impl SetContext<'_> {
    /// Value of `node`.
    pub fn get<R: Send + Sync + 'static>(&self, node: &impl Readable<R>) -> Result<Arc<R>, EvalError> {
        match self.get_loadable(node)? {
            Loadable::Value(value) => value.downcast::<R>().map_err(|_| {
                EvalError::from_fault(Error::TypeMismatch {
                    key: node.key().clone(),
                    expected: type_name::<R>(),
                })
            }),
            Loadable::Error(error) => Err(EvalError::User(error)),
            Loadable::Loading(pending) => Err(EvalError::Suspend {
                key: node.key().clone(),
                pending,
            }),
        }
    }

    /// Loadable of `node`.
    pub fn get_loadable<R>(&self, node: &impl Readable<R>) -> Result<Loadable, EvalError> {
        self.store.config().registry().register(node.node());
        get_node_loadable(self.store, self.tree, node.key(), &EvalStack::new())
            .map(|loadable| loadable.settled())
            .map_err(EvalError::from_fault)
    }

    /// Set `node` to `value`.
    pub fn set<R: Send + Sync + 'static>(&self, node: &impl Writable<R>, value: R) -> Result<(), EvalError> {
        self.write(node, WriteValue::value(value))
    }

    /// Set `node` to a loadable.
    pub fn set_loadable<R>(&self, node: &impl Writable<R>, loadable: Loadable) -> Result<(), EvalError> {
        self.write(node, WriteValue::Set(loadable))
    }

    /// Reset `node` to its default.
    pub fn reset<R>(&self, node: &impl Writable<R>) -> Result<(), EvalError> {
        self.write(node, WriteValue::Reset)
    }

    /// Set `node` to `update(current)`.
    pub fn update<R, F>(&self, node: &impl Writable<R>, update: F) -> Result<(), EvalError>
    where
        R: Send + Sync + 'static,
        F: FnOnce(&R) -> R,
    {
        let current = self.get(node)?;
        self.set(node, update(&current))
    }

    fn write<R>(&self, node: &impl Writable<R>, value: WriteValue) -> Result<(), EvalError> {
        self.store.config().registry().register(node.node());
        let writes = set_node_value(self.store, self.tree, node.key(), value, self.stack)
            .map_err(EvalError::from_fault)?;
        self.writes.borrow_mut().extend(writes);
        Ok(())
    }
}
