//! Single-assignment future with continuation replay.
//!
//! An [`Operation`] starts out pending and settles exactly once, either with
//! a value or with an error. Continuations registered while pending are
//! queued and fired in registration order when it settles; continuations
//! registered afterwards run immediately.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

/// Lifecycle of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Succeeded,
    Failed,
}

/// Continuation fired with the value of a successful operation.
pub type OnSuccess<T> = Box<dyn FnOnce(T) + Send>;

/// Continuation fired with the error of a failed operation.
pub type OnFailure = Box<dyn FnOnce(Error) + Send>;

struct Inner<T> {
    state: OperationState,
    value: Option<T>,
    error: Option<Error>,
    on_success: Vec<OnSuccess<T>>,
    on_failure: Vec<OnFailure>,
}

/// Shared handle to a single-assignment result slot.
///
/// Cloning the handle does not clone the slot.
pub struct Operation<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Operation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Operation<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Operation<T> {
    /// Create a pending operation.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: OperationState::Pending,
                value: None,
                error: None,
                on_success: Vec::new(),
                on_failure: Vec::new(),
            })),
        }
    }

    /// Create an operation that already holds `value`.
    pub fn resolved(value: T) -> Self {
        let op = Self::new();
        op.resolve(value);
        op
    }

    /// Create an operation that already holds `error`.
    pub fn rejected(error: Error) -> Self {
        let op = Self::new();
        op.reject(error);
        op
    }

    // Continuations run with the lock released, so a poisoned lock only
    // means a panic happened between two field writes we never leave torn.
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle with a value.
    ///
    /// Returns `false` without touching anything if the operation has
    /// already settled.
    pub fn resolve(&self, value: T) -> bool {
        let callbacks = {
            let mut inner = self.lock();
            if inner.state != OperationState::Pending {
                tracing::debug!("Ignoring resolve of settled operation ({:?})", inner.state);
                return false;
            }
            inner.state = OperationState::Succeeded;
            inner.value = Some(value.clone());
            inner.on_failure.clear();
            std::mem::take(&mut inner.on_success)
        };

        for callback in callbacks {
            callback(value.clone());
        }
        true
    }

    /// Settle with an error.
    ///
    /// Returns `false` without touching anything if the operation has
    /// already settled.
    pub fn reject(&self, error: Error) -> bool {
        let callbacks = {
            let mut inner = self.lock();
            if inner.state != OperationState::Pending {
                tracing::debug!(
                    "Ignoring reject of settled operation ({:?}): {}",
                    inner.state,
                    error
                );
                return false;
            }
            inner.state = OperationState::Failed;
            inner.error = Some(error.clone());
            inner.on_success.clear();
            std::mem::take(&mut inner.on_failure)
        };

        for callback in callbacks {
            callback(error.clone());
        }
        true
    }

    /// Settle from a `Result`.
    pub fn settle(&self, result: Result<T>) -> bool {
        match result {
            Ok(value) => self.resolve(value),
            Err(error) => self.reject(error),
        }
    }

    /// Register continuations for either outcome.
    ///
    /// While pending both are queued; once settled the matching one runs
    /// immediately and the other is dropped.
    pub fn on_resolved(
        &self,
        on_success: Option<OnSuccess<T>>,
        on_failure: Option<OnFailure>,
    ) -> &Self {
        let mut inner = self.lock();
        match inner.state {
            OperationState::Pending => {
                if let Some(callback) = on_success {
                    inner.on_success.push(callback);
                }
                if let Some(callback) = on_failure {
                    inner.on_failure.push(callback);
                }
            }
            OperationState::Succeeded => {
                let value = inner.value.clone();
                drop(inner);
                if let (Some(callback), Some(value)) = (on_success, value) {
                    callback(value);
                }
            }
            OperationState::Failed => {
                let error = inner.error.clone();
                drop(inner);
                if let (Some(callback), Some(error)) = (on_failure, error) {
                    callback(error);
                }
            }
        }
        self
    }

    /// Register a continuation for the success outcome only.
    pub fn on_success(&self, callback: impl FnOnce(T) + Send + 'static) -> &Self {
        self.on_resolved(Some(Box::new(callback)), None)
    }

    /// Register a continuation for the failure outcome only.
    pub fn on_failure(&self, callback: impl FnOnce(Error) + Send + 'static) -> &Self {
        self.on_resolved(None, Some(Box::new(callback)))
    }

    /// Register one continuation that sees either outcome.
    pub fn on_settled(&self, callback: impl FnOnce(Result<T>) + Send + 'static) -> &Self {
        let slot = Arc::new(Mutex::new(Some(callback)));
        let on_error = Arc::clone(&slot);

        self.on_resolved(
            Some(Box::new(move |value| {
                if let Some(callback) = take_slot(&slot) {
                    callback(Ok(value));
                }
            })),
            Some(Box::new(move |error| {
                if let Some(callback) = take_slot(&on_error) {
                    callback(Err(error));
                }
            })),
        )
    }

    pub fn state(&self) -> OperationState {
        self.lock().state
    }

    pub fn is_pending(&self) -> bool {
        self.state() == OperationState::Pending
    }

    /// The value, if the operation succeeded.
    pub fn value(&self) -> Option<T> {
        self.lock().value.clone()
    }

    /// The error, if the operation failed.
    pub fn error(&self) -> Option<Error> {
        self.lock().error.clone()
    }
}

fn take_slot<F>(slot: &Mutex<Option<F>>) -> Option<F> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self
            .inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or_else(|e| e.into_inner().state);
        f.debug_struct("Operation").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let writer = {
            let log = Arc::clone(&log);
            move |entry: &str| log.lock().unwrap().push(entry.to_string())
        };
        (log, writer)
    }

    #[test]
    fn test_queued_callbacks_fire_in_order() {
        let op = Operation::<i32>::new();
        let (log, write) = recorder();

        let w1 = write.clone();
        let w2 = write.clone();
        op.on_success(move |v| w1(&format!("first {v}")))
            .on_success(move |v| w2(&format!("second {v}")));

        assert!(log.lock().unwrap().is_empty());
        assert!(op.resolve(7));
        assert_eq!(*log.lock().unwrap(), vec!["first 7", "second 7"]);
        assert_eq!(op.state(), OperationState::Succeeded);
        assert_eq!(op.value(), Some(7));
    }

    #[test]
    fn test_late_registration_runs_immediately() {
        let op = Operation::resolved("done".to_string());
        let (log, write) = recorder();
        op.on_success(move |v| write(&v));
        assert_eq!(*log.lock().unwrap(), vec!["done"]);
    }

    #[test]
    fn test_reject_discards_success_callbacks() {
        let op = Operation::<i32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = Arc::clone(&hits);
        let h2 = Arc::clone(&hits);
        op.on_resolved(
            Some(Box::new(move |_| {
                h1.fetch_add(100, Ordering::SeqCst);
            })),
            Some(Box::new(move |e| {
                assert_eq!(e, Error::Construction);
                h2.fetch_add(1, Ordering::SeqCst);
            })),
        );

        assert!(op.reject(Error::Construction));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(op.error(), Some(Error::Construction));
        assert_eq!(op.value(), None);
    }

    #[test]
    fn test_second_resolution_is_ignored() {
        let op = Operation::<i32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        op.on_success(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(op.resolve(1));
        assert!(!op.resolve(2));
        assert!(!op.reject(Error::Closed));
        assert_eq!(op.value(), Some(1));
        assert_eq!(op.state(), OperationState::Succeeded);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_without_handler_is_silent() {
        let op = Operation::<i32>::new();
        op.on_success(|_| panic!("must not run"));
        op.reject(Error::EmptySequence);
        op.on_success(|_| panic!("must not run"));
        assert_eq!(op.state(), OperationState::Failed);
    }

    #[test]
    fn test_on_settled_sees_both_outcomes() {
        let ok = Operation::<i32>::new();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        ok.on_settled(move |r| *s.lock().unwrap() = Some(r));
        ok.resolve(3);
        assert_eq!(*seen.lock().unwrap(), Some(Ok(3)));

        let failed = Operation::<i32>::rejected(Error::Closed);
        let s = Arc::clone(&seen);
        failed.on_settled(move |r| *s.lock().unwrap() = Some(r));
        assert_eq!(*seen.lock().unwrap(), Some(Err(Error::Closed)));
    }

    #[test]
    fn test_callback_may_register_on_same_operation() {
        let op = Operation::<i32>::new();
        let (log, write) = recorder();

        let inner_op = op.clone();
        op.on_success(move |v| {
            let write = write.clone();
            inner_op.on_success(move |again| write(&format!("{v}/{again}")));
        });

        op.resolve(5);
        assert_eq!(*log.lock().unwrap(), vec!["5/5"]);
    }
}
