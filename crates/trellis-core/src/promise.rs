//! Cancellable promises and retry.
//!
//! A [`Promise`] is a spawned tokio task with an observable state and a
//! cancellation hook. A [`RetriablePromise`] re-runs its operation on
//! failure according to a [`RetryPolicy`].

use std::convert::Infallible;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::{AbortHandle, Abortable, Aborted};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::logging::targets;

/// A shareable operation error.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// The lifecycle state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    /// The operation is running.
    Executing,
    /// The operation produced a value.
    Complete,
    /// The operation failed.
    Error,
    /// The promise was cancelled before it finished.
    Cancelled,
}

impl PromiseState {
    /// Whether the state is final.
    pub fn is_terminal(self) -> bool {
        self != Self::Executing
    }
}

/// Ways a promise can fail.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PromiseError {
    /// The operation returned an error.
    #[error("operation failed: {0}")]
    Failed(SharedError),
    /// The promise was cancelled.
    #[error("promise was cancelled")]
    Cancelled,
    /// The operation panicked.
    #[error("operation panicked")]
    Panicked,
    /// Every allowed attempt failed.
    #[error("operation failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made, the first one included.
        attempts: usize,
        /// The error from the final attempt.
        last: SharedError,
    },
}

impl PromiseError {
    /// Wrap an operation error.
    pub fn failed<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Failed(Arc::new(error))
    }
}

type CancelHook = Box<dyn FnOnce() + Send>;

enum Inner<T> {
    Ready(Option<T>),
    Task {
        join: JoinHandle<Result<T, PromiseError>>,
        abort: AbortHandle,
    },
}

/// A cancellable asynchronous result.
#[must_use = "a promise's error is lost unless it is awaited"]
pub struct Promise<T> {
    state: Arc<Mutex<PromiseState>>,
    inner: Inner<T>,
    on_cancel: Mutex<Option<CancelHook>>,
}

impl<T: Send + 'static> Promise<T> {
    /// Run `operation` on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn<Fut, E>(operation: Fut) -> Self
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        Self::spawn_settled(async move { operation.await.map_err(PromiseError::failed) })
    }

    fn spawn_settled<Fut>(operation: Fut) -> Self
    where
        Fut: Future<Output = Result<T, PromiseError>> + Send + 'static,
    {
        let (abort, registration) = AbortHandle::new_pair();
        let state = Arc::new(Mutex::new(PromiseState::Executing));
        let task_state = state.clone();

        let join = tokio::spawn(async move {
            let outcome = match Abortable::new(operation, registration).await {
                Ok(outcome) => outcome,
                Err(Aborted) => return Err(PromiseError::Cancelled),
            };
            let mut state = task_state.lock();
            // Cancellation that raced the last poll wins.
            if *state != PromiseState::Executing {
                return Err(PromiseError::Cancelled);
            }
            *state = match &outcome {
                Ok(_) => PromiseState::Complete,
                Err(err) => {
                    tracing::debug!(target: targets::PROMISE, %err, "promise failed");
                    PromiseState::Error
                }
            };
            outcome
        });

        Self {
            state,
            inner: Inner::Task { join, abort },
            on_cancel: Mutex::new(None),
        }
    }

    /// A promise that is already complete with `value`.
    pub fn wrap(value: T) -> Self {
        Self {
            state: Arc::new(Mutex::new(PromiseState::Complete)),
            inner: Inner::Ready(Some(value)),
            on_cancel: Mutex::new(None),
        }
    }

    /// Register the hook run if the promise is cancelled.
    pub fn on_cancel<F>(self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        *self.on_cancel.lock() = Some(Box::new(hook));
        self
    }

    /// The current state.
    pub fn state(&self) -> PromiseState {
        *self.state.lock()
    }

    /// Cancel the operation if it is still running.
    ///
    /// Runs the cancel hook and returns `true` if the promise was cancelled.
    /// Finished promises are left untouched.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != PromiseState::Executing {
                return false;
            }
            *state = PromiseState::Cancelled;
        }
        if let Inner::Task { abort, .. } = &self.inner {
            abort.abort();
        }
        tracing::debug!(target: targets::PROMISE, "promise cancelled");
        if let Some(hook) = self.on_cancel.lock().take() {
            hook();
        }
        true
    }

    /// Wait for the result.
    pub async fn wait(self) -> Result<T, PromiseError> {
        match self.inner {
            Inner::Ready(Some(value)) => Ok(value),
            Inner::Ready(None) => Err(PromiseError::Cancelled),
            Inner::Task { join, .. } => match join.await {
                Ok(outcome) => outcome,
                Err(err) if err.is_cancelled() => Err(PromiseError::Cancelled),
                Err(_) => {
                    *self.state.lock() = PromiseState::Error;
                    Err(PromiseError::Panicked)
                }
            },
        }
    }
}

impl Promise<()> {
    /// A promise that completes after `duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::spawn(async move {
            tokio::time::sleep(duration).await;
            Ok::<(), Infallible>(())
        })
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

/// Predicate classifying an error as worth retrying.
pub type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// How a [`RetriablePromise`] re-runs a failed operation.
pub struct RetryPolicy<E> {
    /// Retries allowed after the first attempt.
    pub max_retries: usize,
    /// Delays cycled through between attempts. Empty means no delay.
    pub durations: Vec<Duration>,
    /// Classifies errors. Without one, every error is retriable.
    pub is_retriable: Option<RetryPredicate<E>>,
}

impl<E> RetryPolicy<E> {
    /// Allow `max_retries` immediate retries.
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            durations: Vec::new(),
            is_retriable: None,
        }
    }

    /// Set the delays between attempts.
    pub fn with_durations(mut self, durations: impl Into<Vec<Duration>>) -> Self {
        self.durations = durations.into();
        self
    }

    /// Set the retriable-error predicate.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.is_retriable = Some(Arc::new(predicate));
        self
    }

    /// The delay before retry number `retry_index` (zero-based).
    pub fn delay_for(&self, retry_index: usize) -> Option<Duration> {
        if self.durations.is_empty() {
            None
        } else {
            Some(self.durations[retry_index % self.durations.len()])
        }
    }

    fn classifies_retriable(&self, error: &E) -> bool {
        self.is_retriable.as_ref().is_none_or(|predicate| predicate(error))
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            durations: self.durations.clone(),
            is_retriable: self.is_retriable.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("durations", &self.durations)
            .field("has_predicate", &self.is_retriable.is_some())
            .finish()
    }
}

/// A promise that retries its operation on failure.
#[must_use = "a promise's error is lost unless it is awaited"]
pub struct RetriablePromise<T> {
    promise: Promise<T>,
    retries: Arc<AtomicUsize>,
}

impl<T: Send + 'static> RetriablePromise<T> {
    /// Start the operation produced by `factory`, retrying per `policy`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn<F, Fut, E>(policy: RetryPolicy<E>, mut factory: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let retries = Arc::new(AtomicUsize::new(0));
        let counter = retries.clone();

        let promise = Promise::spawn_settled(async move {
            loop {
                let error = match factory().await {
                    Ok(value) => return Ok(value),
                    Err(error) => error,
                };

                let retry_index = counter.load(Ordering::Acquire);
                if !policy.classifies_retriable(&error) {
                    return Err(PromiseError::failed(error));
                }
                if retry_index >= policy.max_retries {
                    return Err(PromiseError::RetriesExhausted {
                        attempts: retry_index + 1,
                        last: Arc::new(error),
                    });
                }

                let delay = policy.delay_for(retry_index);
                counter.fetch_add(1, Ordering::AcqRel);
                tracing::debug!(target: targets::PROMISE, retry = retry_index + 1, ?delay, %error, "retrying");
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
            }
        });

        Self { promise, retries }
    }

    /// Retries started so far.
    pub fn retries(&self) -> usize {
        self.retries.load(Ordering::Acquire)
    }

    /// The current state.
    pub fn state(&self) -> PromiseState {
        self.promise.state()
    }

    /// Register the hook run if the promise is cancelled.
    pub fn on_cancel<F>(self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            promise: self.promise.on_cancel(hook),
            retries: self.retries,
        }
    }

    /// Cancel the operation, including any pending retry.
    pub fn cancel(&self) -> bool {
        self.promise.cancel()
    }

    /// Wait for the result. Also returns the number of retries performed.
    pub async fn wait(self) -> (Result<T, PromiseError>, usize) {
        let retries = self.retries;
        let outcome = self.promise.wait().await;
        (outcome, retries.load(Ordering::Acquire))
    }
}
