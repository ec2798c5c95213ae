//! Tri-state value wrapper for node values.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};

/// Type-erased node value.
///
/// Values are shared, never mutated in place. Two values are "the same" when
/// they are the same allocation; see [`Loadable::is_same`].
pub type Value = Arc<dyn Any + Send + Sync>;

/// A value that is still being computed.
///
/// Resolves to a settled (non-loading) [`Loadable`]. Cloning shares the
/// underlying computation.
pub type Pending = Shared<BoxFuture<'static, Loadable>>;

/// State tag of a [`Loadable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LoadableState {
    /// A value is available.
    HasValue,
    /// Evaluation failed.
    HasError,
    /// Evaluation has not settled yet.
    Loading,
}

/// The current value of a node: a value, an error, or a pending computation.
///
/// Immutable once constructed; cloning is cheap.
#[derive(Clone)]
pub enum Loadable {
    /// Settled value.
    Value(Value),
    /// Settled error.
    Error(Arc<anyhow::Error>),
    /// Pending value.
    Loading(Pending),
}

impl Loadable {
    /// Wrap a concrete value.
    pub fn with_value<T: Any + Send + Sync>(value: T) -> Self {
        Loadable::Value(Arc::new(value))
    }

    /// Wrap an error.
    pub fn with_error(error: impl Into<anyhow::Error>) -> Self {
        Loadable::Error(Arc::new(error.into()))
    }

    /// Wrap a future that settles into a loadable.
    pub fn loading<F>(future: F) -> Self
    where
        F: Future<Output = Loadable> + Send + 'static,
    {
        Loadable::Loading(future.boxed().shared())
    }

    /// The state tag.
    pub fn state(&self) -> LoadableState {
        match self {
            Loadable::Value(_) => LoadableState::HasValue,
            Loadable::Error(_) => LoadableState::HasError,
            Loadable::Loading(_) => LoadableState::Loading,
        }
    }

    /// Returns true if a value is available.
    pub fn has_value(&self) -> bool {
        matches!(self, Loadable::Value(_))
    }

    /// Returns true if evaluation has not settled.
    pub fn is_loading(&self) -> bool {
        matches!(self, Loadable::Loading(_))
    }

    /// The type-erased value, if any.
    pub fn contents(&self) -> Option<&Value> {
        match self {
            Loadable::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The value downcast to `T`.
    ///
    /// Returns `None` if there is no value or it has another type.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.contents()
            .and_then(|value| value.clone().downcast::<T>().ok())
    }

    /// The error, if evaluation failed.
    pub fn error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            Loadable::Error(error) => Some(error),
            _ => None,
        }
    }

    /// The pending computation, if still loading.
    pub fn pending(&self) -> Option<&Pending> {
        match self {
            Loadable::Loading(pending) => Some(pending),
            _ => None,
        }
    }

    /// Identity comparison.
    ///
    /// Values and errors are the same when they share an allocation, pending
    /// values when they share the computation.
    pub fn is_same(&self, other: &Loadable) -> bool {
        match (self, other) {
            (Loadable::Value(a), Loadable::Value(b)) => Arc::ptr_eq(a, b),
            (Loadable::Error(a), Loadable::Error(b)) => Arc::ptr_eq(a, b),
            (Loadable::Loading(a), Loadable::Loading(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Resolve a pending value whose computation already finished.
    ///
    /// Returns a clone of `self` if it is settled or still running.
    pub fn settled(&self) -> Loadable {
        match self {
            Loadable::Loading(pending) => match pending.peek() {
                Some(output) => output.settled(),
                None => self.clone(),
            },
            _ => self.clone(),
        }
    }

    /// Wait for the loadable to settle.
    pub fn to_future(&self) -> BoxFuture<'static, Result<Value, Arc<anyhow::Error>>> {
        let this = self.clone();
        async move {
            let mut current = this;
            loop {
                match current {
                    Loadable::Value(value) => return Ok(value),
                    Loadable::Error(error) => return Err(error),
                    Loadable::Loading(pending) => current = pending.await,
                }
            }
        }
        .boxed()
    }
}

impl fmt::Debug for Loadable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loadable::Value(_) => write!(f, "Loadable::Value(..)"),
            Loadable::Error(error) => write!(f, "Loadable::Error({})", error),
            Loadable::Loading(_) => write!(f, "Loadable::Loading"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_value_downcast() {
        let loadable = Loadable::with_value(42i32);
        assert_eq!(loadable.state(), LoadableState::HasValue);
        assert_eq!(*loadable.value::<i32>().unwrap(), 42);
        assert!(loadable.value::<String>().is_none());
        assert!(loadable.error().is_none());
    }

    #[test]
    fn test_identity() {
        let a = Loadable::with_value(1i32);
        let b = Loadable::with_value(1i32);
        assert!(a.is_same(&a.clone()));
        assert!(!a.is_same(&b));

        let pending = Loadable::loading(async { Loadable::with_value(1i32) });
        assert!(pending.is_same(&pending.clone()));
        assert!(!pending.is_same(&a));
    }

    #[test]
    fn test_to_future_settles_nested_loading() {
        let inner = Loadable::loading(async { Loadable::with_value("done") });
        let outer = Loadable::loading(async move { inner });
        let value = block_on(outer.to_future()).unwrap();
        assert_eq!(*value.downcast::<&str>().unwrap(), "done");

        let failed = Loadable::with_error(anyhow::anyhow!("nope"));
        assert!(block_on(failed.to_future()).is_err());
    }

    #[test]
    fn test_settled_after_completion() {
        let pending = Loadable::loading(async { Loadable::with_value(5u8) });
        assert!(pending.settled().is_loading());
        block_on(pending.to_future()).unwrap();
        let settled = pending.settled();
        assert_eq!(*settled.value::<u8>().unwrap(), 5);
        assert!(settled.is_same(&pending.settled()));

        let failed = Loadable::with_error(anyhow::anyhow!("nope"));
        assert_eq!(failed.state(), LoadableState::HasError);
        assert!(block_on(failed.to_future()).is_err());
    }
}
