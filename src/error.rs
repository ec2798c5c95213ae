//! Error types for the state container.
//!
//! Two layers:
//! - [`Error`] describes faults of the container itself (misuse, cycles,
//!   consistency problems). It is what public operations return.
//! - [`EvalError`] is what selector getters and set handlers return. User
//!   errors propagate into it with `?` and end up as a has-error
//!   [`Loadable`](crate::Loadable) instead of escaping the evaluation.

use std::fmt;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::key::{NodeKey, StateId};
use crate::loadable::Pending;

/// Faults of the container.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A selector transitively depends on itself. Always fatal.
    #[error("selector has circular dependencies: {}", format_path(.path))]
    Cycle {
        /// Keys from the first occurrence of the repeated key to its re-entry.
        path: Vec<NodeKey>,
    },

    /// No node is registered under this key.
    #[error("unknown node: {0}")]
    UnknownNode(NodeKey),

    /// Attempt to set a node that has no set handler.
    #[error("attempt to set read-only node: {0}")]
    ReadOnly(NodeKey),

    /// The stored value is not of the requested type.
    #[error("value of {key} is not a {expected}")]
    TypeMismatch {
        /// Key of the node that was read.
        key: NodeKey,
        /// Name of the requested type.
        expected: &'static str,
    },

    /// Read from a snapshot whose reference count already reached zero.
    #[error("snapshot has already been released")]
    SnapshotReleased,

    /// `retain()` on a snapshot whose reference count already reached zero.
    #[error("attempt to retain a snapshot that was already released")]
    RetainReleased,

    /// A tree version that is no longer current, next or previous was used.
    #[error("tried to use discarded tree version {version}")]
    DiscardedTree {
        /// The stale version.
        version: StateId,
    },

    /// An updater needs the current value but the node is still loading.
    #[error("node {0} is not ready")]
    NotReady(NodeKey),

    /// A get/set function failed while applying a write.
    #[error("evaluation of {key} failed: {error}")]
    Evaluation {
        /// Node whose function failed.
        key: NodeKey,
        /// The user error.
        error: Arc<anyhow::Error>,
    },

    /// Operation that only a live store supports was called on a snapshot's store.
    #[error("{0} is not supported on snapshots")]
    UnsupportedOnSnapshot(&'static str),

    /// Batches were closed in a different order than they were opened.
    #[error("incorrect order of batch popping")]
    BatchOrder,

    /// A retain count was decremented below zero.
    #[error("retain count of {0} released more often than retained")]
    RetainUnderflow(String),

    /// A commit found no tree to rotate out.
    #[error("ended a batch with no previous state")]
    MissingPreviousTree,

    /// Nodes were swept while a batch was still building the next tree.
    #[error("releasing nodes is only allowed between batches")]
    SweepDuringBatch,
}

fn format_path(path: &[NodeKey]) -> String {
    path.iter()
        .map(|key| key.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl Error {
    /// Returns true for structural faults that must never be downgraded.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Cycle { .. })
    }
}

/// Error returned from selector getters and set handlers.
///
/// Any `Into<anyhow::Error>` converts into [`EvalError::User`], so `?` works on
/// ordinary fallible calls inside a selector body.
#[derive(Clone)]
pub enum EvalError {
    /// A dependency is still loading; the selector becomes loading too and is
    /// re-evaluated once `pending` settles.
    Suspend {
        /// The loading dependency.
        key: NodeKey,
        /// Future that settles when the dependency does.
        pending: Pending,
    },

    /// A dependency cycle was detected while evaluating a dependency.
    Cycle {
        /// The cycle, see [`Error::Cycle`].
        path: Vec<NodeKey>,
    },

    /// Failure of the selector itself or of one of its dependencies.
    User(Arc<anyhow::Error>),
}

impl fmt::Debug for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Suspend { key, .. } => write!(f, "Suspend({})", key),
            EvalError::Cycle { path } => write!(f, "Cycle({})", format_path(path)),
            EvalError::User(e) => write!(f, "User({:?})", e),
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Suspend { key, .. } => write!(f, "waiting for {}", key),
            EvalError::Cycle { path } => {
                write!(f, "dependency cycle detected: {}", format_path(path))
            }
            EvalError::User(e) => write!(f, "{}", e),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for EvalError {
    fn from(err: T) -> Self {
        EvalError::User(Arc::new(err.into()))
    }
}

impl EvalError {
    /// The user error, if this is one.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            EvalError::User(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn from_fault(err: Error) -> Self {
        match err {
            Error::Cycle { path } => EvalError::Cycle { path },
            other => EvalError::User(Arc::new(anyhow::Error::new(other))),
        }
    }
}

/// Report misuse of the API.
///
/// In strict mode the fault is returned so the caller fails; otherwise it is
/// logged and the operation continues.
pub(crate) fn invalid_usage(config: &RuntimeConfig, err: Error) -> Result<(), Error> {
    if config.strict() || err.is_fatal() {
        return Err(err);
    }
    recoverable_violation(config, err);
    Ok(())
}

/// Report a container inconsistency that indicates a bug in a collaborator.
///
/// Never fails the surrounding operation.
pub(crate) fn recoverable_violation(config: &RuntimeConfig, err: Error) {
    tracing::warn!(error = %err, "recoverable violation");
    config.tracer().on_violation(&err);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display() {
        let err = Error::Cycle {
            path: vec![NodeKey::new("a"), NodeKey::new("b"), NodeKey::new("a")],
        };
        assert_eq!(
            err.to_string(),
            "selector has circular dependencies: a -> b -> a"
        );
        assert!(err.is_fatal());
        assert!(!Error::SnapshotReleased.is_fatal());
    }

    #[test]
    fn test_eval_error_from_anyhow() {
        let err: EvalError = anyhow::anyhow!("boom").into();
        assert!(err.user_error().is_some());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_eval_error_from_parse_error() {
        fn parse(input: &str) -> Result<i32, EvalError> {
            Ok(input.parse::<i32>()?)
        }
        assert_eq!(parse("7").unwrap(), 7);
        assert!(parse("x").unwrap_err().user_error().is_some());
    }

    #[test]
    fn test_fault_keeps_cycles_structural() {
        let cycle = EvalError::from_fault(Error::Cycle { path: vec![] });
        assert!(matches!(cycle, EvalError::Cycle { .. }));
        let other = EvalError::from_fault(Error::UnknownNode(NodeKey::new("x")));
        assert!(other.user_error().is_some());
    }

    #[test]
    fn test_invalid_usage_respects_strict() {
        let strict = RuntimeConfig::builder().strict(true).build();
        assert!(invalid_usage(&strict, Error::SnapshotReleased).is_err());

        let lenient = RuntimeConfig::builder().strict(false).build();
        assert!(invalid_usage(&lenient, Error::SnapshotReleased).is_ok());
        assert!(invalid_usage(&lenient, Error::Cycle { path: vec![] }).is_err());
    }
}
