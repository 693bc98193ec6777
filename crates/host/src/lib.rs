//! The transport side of micro-host.
//!
//! A host owns an [`Application`](micro_host_core::Application) and a host
//! pipeline, and turns network exchanges into calls:
//!
//! - [`Http1Connection`] serves one HTTP/1.1 connection, one exchange at a
//!   time, leaving pipelined requests buffered until the current response
//!   has been written
//! - [`Http2Dispatcher`] runs every stream of an HTTP/2 connection as its
//!   own call and implements server push
//! - [`Server`] accepts TCP connections and hands them to [`Http1Connection`]
//! - [`TestHost`] runs calls in process, for tests
//!
//! Calls nobody answered get `404 Not Found`, failed calls get
//! `500 Internal Server Error`.
//!
//! # Example
//!
//! ```no_run
//! use futures::FutureExt;
//! use micro_host::Server;
//! use micro_host_core::{Application, Pipeline, interceptor_fn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut pipeline = Pipeline::application();
//!     pipeline.intercept(
//!         &Pipeline::CALL,
//!         interceptor_fn(|call, execution| {
//!             async move {
//!                 call.response_mut().respond("hello world")?;
//!                 execution.finish();
//!                 Ok(())
//!             }
//!             .boxed()
//!         }),
//!     )?;
//!
//!     let server = Server::builder().address("127.0.0.1:8080")?.application(Application::new(pipeline)).build()?;
//!     server.start().await;
//!     Ok(())
//! }
//! ```

mod config;
mod date;
mod dispatcher;
mod host_pipeline;
mod server;
mod test_host;

pub use config::HostConfig;
pub use date::{DateService, SendDate};
pub use dispatcher::{Http1Connection, Http2Dispatcher};
pub use host_pipeline::{EnterApplication, HostPipelineBuilder};
pub use server::{Server, ServerBuildError, ServerBuilder};
pub use test_host::{TestCall, TestHost, TestHostError};
