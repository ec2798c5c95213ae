//! Runtime configuration shared by every store built from it.
//!
//! Everything that would otherwise be process-wide mutable state lives here:
//! the node registry, the batcher, the batch stack and the memoized snapshot.
//! Stores and snapshots created from the same [`RuntimeConfig`] share them.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::batching::{default_batcher, BatchStack, Batcher};
use crate::node::Registry;
use crate::persistent_map::MapKind;
use crate::scheduler::{Scheduler, TimerScheduler};
use crate::snapshot_cache::SnapshotCache;
use crate::tracer::{NoopTracer, Tracer};

/// Configuration injected into every root and snapshot.
///
/// Cheap to clone; clones share the same registry, batch stack and caches.
#[derive(Clone)]
pub struct RuntimeConfig {
    inner: Arc<ConfigInner>,
}

struct ConfigInner {
    map_kind: MapKind,
    strict: bool,
    memory_management: bool,
    batcher: RwLock<Batcher>,
    scheduler: Arc<dyn Scheduler>,
    tracer: Arc<dyn Tracer>,
    registry: Registry,
    batch_stack: BatchStack,
    snapshot_cache: SnapshotCache,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the configuration.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let config = RuntimeConfig::builder()
    ///     .map_kind(MapKind::Builtin)
    ///     .strict(true)
    ///     .build();
    /// ```
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Strategy for tree-state maps.
    pub fn map_kind(&self) -> MapKind {
        self.inner.map_kind
    }

    /// Whether invalid usage fails the call instead of being logged.
    pub fn strict(&self) -> bool {
        self.inner.strict
    }

    /// Whether releasing a snapshot also releases its retained nodes.
    pub fn memory_management(&self) -> bool {
        self.inner.memory_management
    }

    /// The current batcher.
    pub fn batcher(&self) -> Batcher {
        self.inner.batcher.read().clone()
    }

    /// Replace the batcher, e.g. with a host framework's batching primitive.
    pub fn set_batcher(&self, batcher: Batcher) {
        *self.inner.batcher.write() = batcher;
    }

    /// The timer service.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    /// The tracer.
    pub fn tracer(&self) -> &dyn Tracer {
        self.inner.tracer.as_ref()
    }

    /// Registered node definitions.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub(crate) fn batch_stack(&self) -> &BatchStack {
        &self.inner.batch_stack
    }

    pub(crate) fn snapshot_cache(&self) -> &SnapshotCache {
        &self.inner.snapshot_cache
    }

    /// Returns true if both handles refer to the same configuration.
    pub fn ptr_eq(&self, other: &RuntimeConfig) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("map_kind", &self.inner.map_kind)
            .field("strict", &self.inner.strict)
            .field("memory_management", &self.inner.memory_management)
            .field("nodes", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`RuntimeConfig`].
pub struct RuntimeConfigBuilder {
    map_kind: MapKind,
    strict: bool,
    memory_management: bool,
    batcher: Option<Batcher>,
    scheduler: Option<Arc<dyn Scheduler>>,
    tracer: Option<Arc<dyn Tracer>>,
}

impl Default for RuntimeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            map_kind: MapKind::default(),
            strict: cfg!(debug_assertions),
            memory_management: false,
            batcher: None,
            scheduler: None,
            tracer: None,
        }
    }

    /// Set the persistent map strategy. Defaults to [`MapKind::Hamt`].
    pub fn map_kind(mut self, kind: MapKind) -> Self {
        self.map_kind = kind;
        self
    }

    /// Fail calls on invalid usage instead of logging them.
    ///
    /// Defaults to on in debug builds and off in release builds.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Release a snapshot's retained nodes when the snapshot is released.
    pub fn memory_management(mut self, enabled: bool) -> Self {
        self.memory_management = enabled;
        self
    }

    /// Set the batcher. Defaults to calling the batch immediately.
    pub fn batcher(mut self, batcher: Batcher) -> Self {
        self.batcher = Some(batcher);
        self
    }

    /// Set the timer service.
    ///
    /// Defaults to the shared [`TimerScheduler`]; tests usually inject a
    /// [`TaskQueue`](crate::TaskQueue) to control time.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Set the tracer. Defaults to [`NoopTracer`].
    pub fn tracer<T: Tracer>(mut self, tracer: T) -> Self {
        self.tracer = Some(Arc::new(tracer));
        self
    }

    /// Set a shared tracer.
    pub fn shared_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RuntimeConfig {
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => TimerScheduler::shared(),
        };
        RuntimeConfig {
            inner: Arc::new(ConfigInner {
                map_kind: self.map_kind,
                strict: self.strict,
                memory_management: self.memory_management,
                batcher: RwLock::new(self.batcher.unwrap_or_else(default_batcher)),
                scheduler,
                tracer: self.tracer.unwrap_or_else(|| Arc::new(NoopTracer)),
                registry: Registry::default(),
                batch_stack: BatchStack::default(),
                snapshot_cache: SnapshotCache::default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::new();
        assert_eq!(config.map_kind(), MapKind::Hamt);
        assert_eq!(config.strict(), cfg!(debug_assertions));
        assert!(!config.memory_management());
        assert!(config.ptr_eq(&config.clone()));
        assert!(!config.ptr_eq(&RuntimeConfig::new()));
    }

    #[test]
    fn test_set_batcher_is_shared_by_clones() {
        let config = RuntimeConfig::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        config.clone().set_batcher(Arc::new(move |batch: &mut dyn FnMut()| {
            counted.fetch_add(1, Ordering::SeqCst);
            batch();
        }));

        (config.batcher())(&mut || {});
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
