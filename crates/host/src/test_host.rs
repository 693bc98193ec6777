//! An in-process host for exercising applications without a socket.
//!
//! Calls go through the same host pipeline and fallback handling as on a
//! real connection, but a failed call surfaces as an error instead of a
//! `500`, so tests see what went wrong.

use std::sync::Arc;

use bytes::Bytes;
use http::request::Builder;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::BodyExt;
use micro_host_core::{
    Application, ApplicationCall, ApplicationRequest, ApplicationResponse, CancelHandle, ExecutionError, ExecutionOutcome, Pipeline,
    RequestBody,
};
use micro_host_http::protocol::RequestHeader;
use thiserror::Error;
use tracing::debug;

use crate::config::HostConfig;
use crate::dispatcher::run_call;
use crate::host_pipeline::HostPipelineBuilder;

#[derive(Debug, Error)]
pub enum TestHostError {
    #[error("invalid test request: {0}")]
    InvalidRequest(#[from] http::Error),

    #[error("call failed: {0}")]
    Failed(#[source] ExecutionError),

    #[error("call produced no response")]
    NoResponse,
}

/// The observable result of one call.
#[derive(Debug)]
pub struct TestCall {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    outcome: ExecutionOutcome,
}

impl TestCall {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether an interceptor finished the call, as opposed to the host
    /// answering for it.
    pub fn is_handled(&self) -> bool {
        self.outcome.is_finished()
    }
}

#[derive(Debug)]
pub struct TestHost {
    application: Arc<Application>,
    host_pipeline: Arc<Pipeline>,
    config: HostConfig,
}

impl TestHost {
    pub fn new(application: Application) -> Self {
        Self::with_host_pipeline(application, HostPipelineBuilder::new())
    }

    pub fn with_host_pipeline(application: Application, host_pipeline: HostPipelineBuilder) -> Self {
        Self {
            application: Arc::new(application),
            host_pipeline: Arc::new(host_pipeline.build()),
            config: HostConfig::default(),
        }
    }

    pub fn application(&self) -> &Arc<Application> {
        &self.application
    }

    pub async fn handle_request<F>(&self, setup: F) -> Result<TestCall, TestHostError>
    where
        F: FnOnce(Builder) -> Builder,
    {
        self.handle_request_with_body(setup, Bytes::new()).await
    }

    pub async fn handle_request_with_body<F>(&self, setup: F, body: impl Into<Bytes>) -> Result<TestCall, TestHostError>
    where
        F: FnOnce(Builder) -> Builder,
    {
        let header = RequestHeader::from(setup(Request::builder()).body(())?);
        let body = body.into();
        let body = if body.is_empty() {
            RequestBody::empty()
        } else {
            let (tx, request_body) = RequestBody::channel(1);
            if tx.try_send(Ok(body)).is_err() {
                debug!("request body dropped before the call started");
            }
            request_body
        };

        let (response, response_rx) = ApplicationResponse::channel();
        let response = response.with_body_capacity(self.config.response_channel_capacity);
        let call = ApplicationCall::new(Arc::clone(&self.application), ApplicationRequest::new(header, body), response);

        let collect = async {
            let response = response_rx.await.ok()?;
            let (parts, body) = response.into_parts();
            // an aborted body means the call failed, which the outcome reports
            let collected = body.collect().await.ok()?;
            Some((parts, collected.to_bytes()))
        };
        let (outcome, response) =
            tokio::join!(run_call(call, &self.host_pipeline, CancelHandle::new(), self.config.call_timeout()), collect);

        if let ExecutionOutcome::Failed(e) = outcome {
            return Err(TestHostError::Failed(e));
        }
        let (parts, body) = response.ok_or(TestHostError::NoResponse)?;
        Ok(TestCall { status: parts.status, headers: parts.headers, body, outcome })
    }

    /// Disposes the application. Also happens on drop.
    pub fn dispose(&self) {
        self.application.dispose();
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.dispose();
    }
}
