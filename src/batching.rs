//! Batching of writes into one commit.
//!
//! [`batch_updates`] runs a callback inside the configured [`Batcher`] with a
//! batch frame open. Writes made while a frame is open are queued per store
//! and applied together when the outermost frame that queued them ends, so
//! subscribers never see a half-applied batch.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::{invalid_usage, recoverable_violation, Error};
use crate::key::StoreId;
use crate::store::StoreRef;
use crate::value_interface::{apply_actions_to_store, Action};

/// Host batching primitive.
///
/// Receives the batch and must call it exactly once, e.g. inside a UI
/// framework's own batching scope.
pub type Batcher = Arc<dyn Fn(&mut dyn FnMut()) + Send + Sync>;

/// Batcher that runs the batch immediately.
pub fn default_batcher() -> Batcher {
    Arc::new(|batch: &mut dyn FnMut()| batch())
}

struct BatchFrame {
    id: u64,
    queued: IndexMap<StoreId, (StoreRef, Vec<Action>), RandomState>,
    commits: IndexMap<StoreId, StoreRef, RandomState>,
}

/// Open batch frames of one configuration, innermost last.
#[derive(Default)]
pub(crate) struct BatchStack {
    frames: Mutex<Vec<BatchFrame>>,
    next_id: AtomicU64,
}

impl BatchStack {
    fn start(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.frames.lock().push(BatchFrame {
            id,
            queued: IndexMap::default(),
            commits: IndexMap::default(),
        });
        id
    }

    fn end(&self, id: u64) -> Result<BatchFrame, Error> {
        let mut frames = self.frames.lock();
        match frames.last() {
            Some(frame) if frame.id == id => frames.pop().ok_or(Error::BatchOrder),
            _ => Err(Error::BatchOrder),
        }
    }

    // Drop frames opened after `id` that were never closed.
    fn discard_above(&self, id: u64) {
        let mut frames = self.frames.lock();
        if let Some(index) = frames.iter().rposition(|frame| frame.id == id) {
            frames.truncate(index + 1);
        }
    }

    /// Queue `action` on the innermost frame; hands it back if no batch is open.
    pub(crate) fn queue(&self, store: &StoreRef, action: Action) -> Option<Action> {
        let mut frames = self.frames.lock();
        let Some(frame) = frames.last_mut() else {
            return Some(action);
        };
        frame
            .queued
            .entry(store.store_id())
            .or_insert_with(|| (store.clone(), Vec::new()))
            .1
            .push(action);
        None
    }

    /// Defer `store`'s commit to the end of the innermost frame.
    ///
    /// Returns false if no batch is open.
    pub(crate) fn defer_commit(&self, store: &StoreRef) -> bool {
        let mut frames = self.frames.lock();
        let Some(frame) = frames.last_mut() else {
            return false;
        };
        frame
            .commits
            .entry(store.store_id())
            .or_insert_with(|| store.clone());
        true
    }

    /// Returns true if a batch is open.
    pub(crate) fn is_open(&self) -> bool {
        !self.frames.lock().is_empty()
    }
}

impl fmt::Debug for BatchStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchStack")
            .field("depth", &self.frames.lock().len())
            .finish()
    }
}

/// Ends its frame when dropped without finishing, so writes queued before a
/// panic are still applied and the batch is not left open.
struct BatchGuard<'a> {
    config: &'a RuntimeConfig,
    id: Option<u64>,
}

impl<'a> BatchGuard<'a> {
    fn start(config: &'a RuntimeConfig) -> Self {
        Self {
            config,
            id: Some(config.batch_stack().start()),
        }
    }

    fn finish(mut self) -> Result<(), Error> {
        match self.id.take() {
            Some(id) => end_batch(self.config, id),
            None => Ok(()),
        }
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            tracing::debug!(batch = id, "ending unfinished batch");
            self.config.batch_stack().discard_above(id);
            if let Err(err) = end_batch(self.config, id) {
                recoverable_violation(self.config, err);
            }
        }
    }
}

/// Run `callback` as one batch.
///
/// Writes made inside are applied when the batch ends, and each touched store
/// commits once. Errors of queued writes are reported through the
/// invalid-usage channel; cycles are always returned.
pub fn batch_updates<R>(config: &RuntimeConfig, callback: impl FnOnce() -> R) -> Result<R, Error> {
    let mut pending = Some(callback);
    let mut output = None;
    let mut batch = || {
        if let Some(callback) = pending.take() {
            output = Some(run_batch(config, callback));
        }
    };
    (config.batcher())(&mut batch);

    match (output, pending) {
        (Some(output), _) => output,
        // The batcher never ran the batch.
        (None, Some(callback)) => run_batch(config, callback),
        (None, None) => unreachable!("batch consumed without producing output"),
    }
}

fn run_batch<R>(config: &RuntimeConfig, callback: impl FnOnce() -> R) -> Result<R, Error> {
    let guard = BatchGuard::start(config);
    let output = callback();
    guard.finish()?;
    Ok(output)
}

fn end_batch(config: &RuntimeConfig, id: u64) -> Result<(), Error> {
    let frame = config.batch_stack().end(id)?;
    let mut first_error = None;

    for (_, (store, actions)) in frame.queued {
        if let Err(err) = apply_actions_to_store(&store, actions) {
            if let Err(err) = invalid_usage(config, err) {
                first_error.get_or_insert(err);
            }
        }
    }
    for (_, store) in frame.commits {
        if !config.batch_stack().defer_commit(&store) {
            store.end_batch();
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_batch_runs_inside_custom_batcher() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let config = RuntimeConfig::builder()
            .batcher(Arc::new(move |batch: &mut dyn FnMut()| {
                counted.fetch_add(1, Ordering::SeqCst);
                batch();
            }))
            .build();

        let inside = batch_updates(&config, || config.batch_stack().is_open()).unwrap();
        assert!(inside);
        assert!(!config.batch_stack().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_batcher_that_skips_the_batch_still_runs_it() {
        let config = RuntimeConfig::builder()
            .batcher(Arc::new(|_batch: &mut dyn FnMut()| {}))
            .build();
        assert_eq!(batch_updates(&config, || 7).unwrap(), 7);
    }

    #[test]
    fn test_frames_must_close_in_order() {
        let stack = BatchStack::default();
        let outer = stack.start();
        let inner = stack.start();
        assert!(matches!(stack.end(outer), Err(Error::BatchOrder)));
        assert!(stack.end(inner).is_ok());
        assert!(stack.end(outer).is_ok());
        assert!(!stack.is_open());
    }

    #[test]
    fn test_panicking_batch_closes_its_frame() {
        let config = RuntimeConfig::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = batch_updates(&config, || panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(!config.batch_stack().is_open());
    }

    #[test]
    fn test_unfinished_inner_frames_are_dropped() {
        let stack = BatchStack::default();
        let outer = stack.start();
        stack.start();
        stack.discard_above(outer);
        assert!(stack.end(outer).is_ok());
        assert!(!stack.is_open());
    }
}
