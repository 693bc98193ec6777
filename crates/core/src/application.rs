use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, error, info};

use crate::pipeline::Pipeline;

type CloseHook = Box<dyn FnOnce() + Send>;

/// An application: the pipeline every call is run through, and the cleanup
/// actions to run when it is shut down.
///
/// The pipeline is fixed once the application is built, so it can be shared
/// freely by concurrent calls.
pub struct Application {
    pipeline: Pipeline,
    close_hooks: Mutex<Vec<CloseHook>>,
    disposed: AtomicBool,
}

impl Application {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline, close_hooks: Mutex::new(Vec::new()), disposed: AtomicBool::new(false) }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Registers `hook` to run on [`dispose`](Self::dispose). Hooks added
    /// after disposal never run.
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_disposed() {
            debug!("application already disposed, close hook dropped");
            return;
        }
        self.close_hooks.lock().unwrap_or_else(PoisonError::into_inner).push(Box::new(hook));
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Runs every close hook once, in registration order.
    ///
    /// A panicking hook is logged and the remaining hooks still run. Calling
    /// this more than once has no effect.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let hooks = std::mem::take(&mut *self.close_hooks.lock().unwrap_or_else(PoisonError::into_inner));
        info!(hooks = hooks.len(), "disposing application");
        for (index, hook) in hooks.into_iter().enumerate() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(hook)) {
                let cause = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(index, cause = %cause, "close hook failed");
            }
        }
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application").field("pipeline", &self.pipeline).field("disposed", &self.is_disposed()).finish_non_exhaustive()
    }
}
