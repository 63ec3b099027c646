//! Single-resolution result token.
//!
//! An [`AsyncToken`] stands for the eventual outcome of one operation. It is
//! resolved exactly once, either with a value or with a [`StorageError`], and
//! every callback registered on it observes that one outcome. Clones share the
//! same state, which is how an in-flight operation is handed to several
//! callers at once.
//!
//! Callbacks registered after resolution fire inline on the registering
//! thread. Callbacks registered before resolution fire on the resolving
//! thread, in registration order.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::StorageError;

/// Outcome carried by a resolved token.
pub type Outcome<T> = Result<T, StorageError>;

enum Callback<T> {
    Success(Box<dyn FnOnce(T) + Send>),
    Failure(Box<dyn FnOnce(StorageError) + Send>),
    Complete(Box<dyn FnOnce(Outcome<T>) + Send>),
}

impl<T> Callback<T> {
    fn fire(self, outcome: Outcome<T>) {
        match (self, outcome) {
            (Callback::Success(f), Ok(value)) => f(value),
            (Callback::Failure(f), Err(error)) => f(error),
            (Callback::Complete(f), outcome) => f(outcome),
            _ => {}
        }
    }
}

struct TokenState<T> {
    outcome: Option<Outcome<T>>,
    callbacks: Vec<Callback<T>>,
}

/// Handle to the eventual outcome of one operation.
pub struct AsyncToken<T> {
    state: Arc<Mutex<TokenState<T>>>,
}

impl<T> Clone for AsyncToken<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for AsyncToken<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for AsyncToken<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let status = match &state.outcome {
            None => "pending",
            Some(Ok(_)) => "succeeded",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("AsyncToken")
            .field("status", &status)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

impl<T> AsyncToken<T>
where
    T: Clone + Send + 'static,
{
    /// Create a pending token.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TokenState {
                outcome: None,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Create a token that has already succeeded.
    pub fn succeeded(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    /// Create a token that has already failed.
    pub fn failed(error: StorageError) -> Self {
        Self::from_result(Err(error))
    }

    pub fn from_result(outcome: Outcome<T>) -> Self {
        let token = Self::new();
        token.resolve(outcome);
        token
    }

    fn lock(&self) -> MutexGuard<'_, TokenState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve with a success value. Returns `false` if the token was already
    /// resolved, in which case nothing happens.
    pub fn succeed(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    /// Resolve with a failure. Returns `false` if the token was already
    /// resolved, in which case nothing happens.
    pub fn fail(&self, error: StorageError) -> bool {
        self.resolve(Err(error))
    }

    /// Resolve with an outcome. First writer wins.
    pub fn resolve(&self, outcome: Outcome<T>) -> bool {
        let callbacks = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.callbacks)
        };

        for callback in callbacks {
            callback.fire(outcome.clone());
        }
        true
    }

    fn register(&self, callback: Callback<T>) {
        let outcome = {
            let mut state = self.lock();
            match state.outcome.clone() {
                Some(outcome) => outcome,
                None => {
                    state.callbacks.push(callback);
                    return;
                }
            }
        };
        callback.fire(outcome);
    }

    /// Run `f` with the value once the token succeeds.
    pub fn on_success<F>(&self, f: F) -> &Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.register(Callback::Success(Box::new(f)));
        self
    }

    /// Run `f` with the error once the token fails.
    pub fn on_failure<F>(&self, f: F) -> &Self
    where
        F: FnOnce(StorageError) + Send + 'static,
    {
        self.register(Callback::Failure(Box::new(f)));
        self
    }

    /// Run `f` with the outcome, whichever it is.
    pub fn on_complete<F>(&self, f: F) -> &Self
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.register(Callback::Complete(Box::new(f)));
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.lock().outcome.is_some()
    }

    /// Snapshot of the outcome, `None` while pending.
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.lock().outcome.clone()
    }

    /// Whether both handles refer to the same underlying token.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Derive a token resolving with `f` applied to the success value.
    pub fn map<U, F>(&self, f: F) -> AsyncToken<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.and_then(move |value| Ok(f(value)))
    }

    /// Derive a token from a fallible continuation of the success value.
    pub fn and_then<U, F>(&self, f: F) -> AsyncToken<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Outcome<U> + Send + 'static,
    {
        let derived = AsyncToken::new();
        let target = derived.clone();
        self.on_complete(move |outcome| {
            target.resolve(outcome.and_then(f));
        });
        derived
    }

    /// Wait for the outcome from async code.
    pub async fn wait(&self) -> Outcome<T> {
        let (tx, rx) = oneshot::channel();
        self.on_complete(move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or_else(|_| {
            Err(StorageError::transport(
                "operation abandoned before completion",
            ))
        })
    }
}
