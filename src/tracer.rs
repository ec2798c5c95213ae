//! Tracer trait for observing the container.
//!
//! This module defines the [`Tracer`] hooks that the runtime calls at its
//! interesting points. Every method has an empty default, so implementations
//! only override what they need. The default [`NoopTracer`] costs nothing.
//!
//! # Example
//!
//! ```ignore
//! use atom_flow::{NodeKey, RuntimeConfig, StoreId, Tracer};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn on_node_released(&self, store: StoreId, key: &NodeKey) {
//!         println!("{} released {}", store, key);
//!     }
//! }
//!
//! let config = RuntimeConfig::builder().tracer(PrintTracer).build();
//! ```

use crate::error::Error;
use crate::key::{NodeKey, StateId, StoreId};

/// Outcome of one selector evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationResult {
    /// The getter produced a value.
    Value,
    /// The getter is waiting for a pending dependency or future.
    Loading,
    /// The getter failed.
    Error {
        /// Display form of the error.
        message: String,
    },
}

/// Hooks for observing evaluation, commits and releases.
pub trait Tracer: Send + Sync + 'static {
    /// A selector getter ran against tree `version`.
    #[inline]
    fn on_node_evaluated(&self, _key: &NodeKey, _version: StateId, _result: &EvaluationResult) {}

    /// A selector read was served from its cache.
    #[inline]
    fn on_cache_hit(&self, _key: &NodeKey, _version: StateId) {}

    /// A store committed: `previous` was current before, `current` is now.
    #[inline]
    fn on_commit(&self, _store: StoreId, _previous: StateId, _current: StateId, _dirty: usize) {}

    /// A node was released from a store by the retention sweep.
    #[inline]
    fn on_node_released(&self, _store: StoreId, _key: &NodeKey) {}

    /// A snapshot's reference count reached zero.
    #[inline]
    fn on_snapshot_released(&self, _store: StoreId) {}

    /// A recoverable violation was reported.
    #[inline]
    fn on_violation(&self, _error: &Error) {}
}

/// Tracer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}
