//! The execution engine: drives one call through a pipeline's interceptors.
//!
//! An [`Execution`] walks the flattened interceptor list one entry at a time.
//! Each interceptor is an async function, so suspending simply means awaiting:
//! the task is parked without holding a worker, and when it is woken the
//! same future resumes at the same position. Only one interceptor of an
//! execution is ever being polled, since each one holds the execution
//! exclusively while it runs.
//!
//! Terminal handling happens once, in [`Execution::execute`]:
//!
//! - a failure (returned error, panic, cancellation) moves the state to
//!   [`ExecutionState::Failed`] and runs every `on_fail` hook with the cause
//! - otherwise the state becomes [`ExecutionState::Succeeded`] and every
//!   `on_success` hook runs; the outcome tells the caller whether an
//!   interceptor finished the call or the pipeline ran out
//!
//! After the hooks, a streaming response body is closed on success and
//! aborted on failure.
//!
//! Cancellation is observed through a [`CancelHandle`] shared with the
//! transport: cancelling drops the in-flight interceptor future wherever it
//! is suspended and records [`ExecutionError::Cancelled`].

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use micro_host_http::protocol::{Reason, StreamId};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::call::ApplicationCall;
use crate::pipeline::{BoxError, InterceptorList, Pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    NotStarted,
    Executing,
    Succeeded,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Succeeded | ExecutionState::Failed)
    }
}

/// What the dispatcher learns once an execution is over.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// an interceptor called [`Execution::finish`]
    Finished,
    /// every interceptor proceeded and nobody finished the call
    Unhandled,
    Failed(ExecutionError),
}

impl ExecutionOutcome {
    pub fn state(&self) -> ExecutionState {
        match self {
            ExecutionOutcome::Finished | ExecutionOutcome::Unhandled => ExecutionState::Succeeded,
            ExecutionOutcome::Failed(_) => ExecutionState::Failed,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, ExecutionOutcome::Finished)
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        match self {
            ExecutionOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum ExecutionError {
    #[error("interceptor failed: {source}")]
    Interceptor { source: Arc<dyn StdError + Send + Sync> },

    #[error("interceptor panicked: {message}")]
    Panicked { message: String },

    #[error("execution cancelled: {reason}")]
    Cancelled { reason: CancelReason },
}

impl ExecutionError {
    pub fn interceptor<E: Into<BoxError>>(e: E) -> Self {
        Self::Interceptor { source: Arc::from(e.into()) }
    }

    pub fn cancelled(reason: CancelReason) -> Self {
        Self::Cancelled { reason }
    }

    /// Recovers an `ExecutionError` that travelled through an interceptor's
    /// `?`, wrapping anything else as an interceptor failure.
    pub fn from_box(error: BoxError) -> Self {
        match error.downcast::<ExecutionError>() {
            Ok(e) => *e,
            Err(e) => Self::Interceptor { source: Arc::from(e) },
        }
    }

    fn panicked(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Self::Panicked { message }
    }

    pub fn cancel_reason(&self) -> Option<&CancelReason> {
        match self {
            ExecutionError::Cancelled { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_reason().is_some()
    }
}

/// Why a call's execution was cancelled from outside.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CancelReason {
    #[error("call aborted")]
    Aborted,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("stream {stream_id} reset: {reason}")]
    StreamReset { stream_id: StreamId, reason: Reason },

    #[error("call timed out")]
    TimedOut,
}

/// Shared cancellation switch for one execution, and any fork of it.
///
/// The first reason passed to [`CancelHandle::cancel`] wins.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<OnceCell<CancelReason>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: CancelReason) {
        if self.reason.set(reason).is_ok() {
            trace!(reason = ?self.reason.get(), "cancel requested");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().cloned()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) -> CancelReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(CancelReason::Aborted)
    }
}

type SuccessHook = Box<dyn FnOnce(&mut ApplicationCall) + Send>;
type FailureHook = Box<dyn FnOnce(&mut ApplicationCall, &ExecutionError) + Send>;

/// Hooks registered by an execution and every fork of it.
///
/// Shared rather than owned by each run: a cancelled run is dropped
/// wherever it is suspended, and the hooks its forks registered must still
/// reach [`Execution::complete`].
#[derive(Default)]
struct Hooks {
    success: Vec<SuccessHook>,
    failure: Vec<FailureHook>,
}

#[derive(Clone, Default)]
struct SharedHooks(Arc<Mutex<Hooks>>);

impl SharedHooks {
    fn lock(&self) -> MutexGuard<'_, Hooks> {
        // hooks run outside the lock, so a poisoned lock still holds a consistent list
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self) -> Hooks {
        std::mem::take(&mut *self.lock())
    }
}

/// The continuation handed to every interceptor.
pub struct Execution {
    state: ExecutionState,
    interceptors: InterceptorList,
    next: usize,
    finished: bool,
    failure: Option<ExecutionError>,
    hooks: SharedHooks,
    cancel: CancelHandle,
}

impl Default for Execution {
    fn default() -> Self {
        Self::with_cancel(CancelHandle::new())
    }
}

impl Execution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancelHandle) -> Self {
        Self {
            state: ExecutionState::NotStarted,
            interceptors: Arc::from([]),
            next: 0,
            finished: false,
            failure: None,
            hooks: SharedHooks::default(),
            cancel,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    /// Skips every remaining interceptor; the outcome will be
    /// [`ExecutionOutcome::Finished`]. Calling it again has no effect.
    pub fn finish(&mut self) {
        if !self.finished {
            trace!(remaining = self.interceptors.len().saturating_sub(self.next), "execution finished early");
            self.finished = true;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Runs the rest of the pipeline now and returns once it has completed,
    /// so the calling interceptor can act after everything behind it.
    ///
    /// Returning from an interceptor without calling this proceeds as well.
    pub async fn proceed(&mut self, call: &mut ApplicationCall) -> Result<(), ExecutionError> {
        self.run(call).await;
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub fn on_success<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut ApplicationCall) + Send + 'static,
    {
        self.hooks.lock().success.push(Box::new(hook));
    }

    pub fn on_fail<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut ApplicationCall, &ExecutionError) + Send + 'static,
    {
        self.hooks.lock().failure.push(Box::new(hook));
    }

    /// Runs `pipeline` against `call` as a nested execution.
    ///
    /// The nested run shares this execution's cancellation and registers its
    /// hooks with this execution, in registration order. When it finished the
    /// call, this execution is finished too; when it failed, this execution
    /// fails with the same cause, which is also returned so the interceptor
    /// can `?` it.
    pub async fn fork(&mut self, call: &mut ApplicationCall, pipeline: &Pipeline) -> Result<(), ExecutionError> {
        let mut nested = Execution::with_cancel(self.cancel.clone());
        nested.state = ExecutionState::Executing;
        nested.interceptors = pipeline.interceptors();
        nested.hooks = self.hooks.clone();
        debug!(interceptors = nested.interceptors.len(), "forking execution");

        nested.run(call).await;

        if let Some(e) = nested.failure {
            self.fail(e.clone());
            return Err(e);
        }
        if nested.finished {
            self.finish();
        }
        Ok(())
    }

    /// Drives `call` through `pipeline` to a terminal state, then runs the
    /// matching hooks.
    ///
    /// Never panics and never returns before the hooks have completed.
    pub async fn execute(mut self, call: &mut ApplicationCall, pipeline: &Pipeline) -> ExecutionOutcome {
        debug_assert_eq!(self.state, ExecutionState::NotStarted, "an execution runs once");
        self.state = ExecutionState::Executing;
        self.interceptors = pipeline.interceptors();

        let cancel = self.cancel.clone();
        let cancelled = tokio::select! {
            biased;
            reason = cancel.cancelled() => Some(reason),
            () = self.run(call) => None,
        };
        if let Some(reason) = cancelled {
            debug!(%reason, "execution cancelled");
            self.fail(ExecutionError::cancelled(reason));
        }

        self.complete(call)
    }

    async fn run(&mut self, call: &mut ApplicationCall) {
        while !self.finished && self.failure.is_none() {
            let Some(interceptor) = self.interceptors.get(self.next).cloned() else {
                break;
            };
            self.next += 1;

            let result = AssertUnwindSafe(interceptor.intercept(call, self)).catch_unwind().await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.fail(ExecutionError::from_box(e)),
                Err(payload) => self.fail(ExecutionError::panicked(payload.as_ref())),
            }
        }
    }

    /// Records the first failure; later ones are logged and dropped.
    fn fail(&mut self, e: ExecutionError) {
        match &self.failure {
            None => self.failure = Some(e),
            Some(first) => debug!(cause = %e, first = %first, "ignoring failure after the execution already failed"),
        }
    }

    fn complete(&mut self, call: &mut ApplicationCall) -> ExecutionOutcome {
        let hooks = self.hooks.take();
        match self.failure.take() {
            Some(e) => {
                self.state = ExecutionState::Failed;
                for hook in hooks.failure {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| hook(call, &e)));
                    if let Err(payload) = result {
                        error!(cause = %ExecutionError::panicked(payload.as_ref()), "failure hook panicked");
                    }
                }
                call.response_mut().abort_body();
                ExecutionOutcome::Failed(e)
            }
            None => {
                self.state = ExecutionState::Succeeded;
                for hook in hooks.success {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| hook(call)));
                    if let Err(payload) = result {
                        error!(cause = %ExecutionError::panicked(payload.as_ref()), "success hook panicked");
                    }
                }
                call.response_mut().close_body();
                if self.finished { ExecutionOutcome::Finished } else { ExecutionOutcome::Unhandled }
            }
        }
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("state", &self.state)
            .field("next", &self.next)
            .field("interceptors", &self.interceptors.len())
            .field("finished", &self.finished)
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}
