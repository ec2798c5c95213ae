//! Atom-Flow: a versioned reactive state container.
//!
//! State lives in [`Atom`]s; derived values are computed by [`Selector`]s that
//! record what they read. Every write produces a new immutable tree of atom
//! values, and every tree version has its own dependency graph, so old
//! [`Snapshot`]s stay readable and consistent after later writes.
//!
//! # Key Features
//!
//! - **Copy-on-write snapshots**: cheap to take, isolated from later writes
//! - **Batched commits**: writes inside [`batch_updates`] commit once and notify once
//! - **Dependency-keyed caching**: selectors re-run only when a dependency changed
//! - **Async values**: atoms and selectors may resolve later through [`Loadable::Loading`]
//! - **Retention**: nodes held by no component or zone are swept with their effects
//!
//! # Example
//!
//! ```ignore
//! use atom_flow::{Atom, Root, Selector};
//!
//! let root = Root::default();
//! let count = Atom::new("count", 1);
//! let doubled = Selector::new("doubled", {
//!     let count = count.clone();
//!     move |ctx| Ok(*ctx.get(&count)? * 2)
//! });
//!
//! let before = root.snapshot();
//! root.set(&count, 5).unwrap();
//! assert_eq!(*root.get(&doubled).unwrap(), 10);
//! assert_eq!(*before.get(&doubled).unwrap(), 2);
//! ```
//!
//! # Observation
//!
//! - [`Root::subscribe`] - Notified when a node or its dependencies change
//! - [`Root::observe_transactions`] - Receive the current and previous snapshot per commit
//! - [`Tracer`] - Hook evaluations, commits and releases for external tooling

#![deny(missing_docs)]

mod atom;
mod batching;
mod config;
mod error;
mod family;
mod key;
mod loadable;
mod node;
mod root;
mod selector;
mod snapshot;
mod snapshot_cache;

pub mod evaluation;
pub mod graph;
pub mod persistent_map;
pub mod retention;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod tracer;
pub mod value_interface;

pub use atom::*;
pub use batching::{batch_updates, default_batcher, Batcher};
pub use config::*;
pub use error::{Error, EvalError};
pub use family::*;
pub use key::*;
pub use loadable::*;
pub use node::*;
pub use root::*;
pub use selector::*;
pub use snapshot::{
    MutableSnapshot, NodeFilter, Snapshot, SnapshotRetainer, AUTO_RELEASE_DELAY, SUSPENSE_TIMEOUT,
};
pub use snapshot_cache::{clone_snapshot, SnapshotVersion};

pub use evaluation::NodeInfo;
pub use persistent_map::MapKind;
pub use retention::{RetainGuard, Retainable, RetentionZone};
pub use scheduler::{Scheduler, TaskQueue, TimerScheduler};
pub use state::Metadata;
pub use store::Subscription;
pub use tracer::{EvaluationResult, NoopTracer, Tracer};
