//! The request-processing core of micro-host.
//!
//! A call ([`ApplicationCall`]) is run through a [`Pipeline`]: interceptors
//! registered into named [`Phase`]s, executed in phase order and, within a
//! phase, in registration order. The [`Execution`] handed to each
//! interceptor lets it finish the call early, wrap the rest of the pipeline,
//! fork into another pipeline and register hooks that run once the call
//! reaches a terminal state.
//!
//! This crate knows nothing about sockets: the transport builds the call,
//! runs [`Execution::execute`] and writes whatever the call committed, or a
//! fallback response for an unhandled or failed [`ExecutionOutcome`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use futures::FutureExt;
//! use http::StatusCode;
//! use micro_host_core::{Application, Pipeline, interceptor_fn};
//!
//! let mut pipeline = Pipeline::application();
//! pipeline
//!     .intercept(
//!         &Pipeline::CALL,
//!         interceptor_fn(|call, execution| {
//!             async move {
//!                 call.response_mut().set_status(StatusCode::OK)?;
//!                 call.response_mut().respond("hello")?;
//!                 execution.finish();
//!                 Ok(())
//!             }
//!             .boxed()
//!         }),
//!     )
//!     .unwrap();
//!
//! let application = Arc::new(Application::new(pipeline));
//! # drop(application);
//! ```

mod application;
pub mod call;
mod execution;
mod phase;
mod pipeline;

#[cfg(test)]
mod testing;

pub use application::Application;
pub use call::{
    ApplicationCall, ApplicationRequest, ApplicationResponse, AttributeError, AttributeKey, Attributes, BodyAborted, BodySender,
    BodyWriter,
    PushBuilder, PushError, RequestBody, ResponseBody, ResponseError, ResponsePusher,
};
pub use execution::{CancelHandle, CancelReason, Execution, ExecutionError, ExecutionOutcome, ExecutionState};
pub use phase::{Phase, PhaseError, PhaseGraph, PhaseRelation};
pub use pipeline::{BoxError, Interceptor, InterceptorFn, Pipeline, interceptor_fn};

/// Re-exported so interceptor implementations need no direct dependency.
pub use async_trait::async_trait;
