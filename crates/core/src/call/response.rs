use std::fmt;
use std::sync::Arc;

use http::header::{HeaderName, IntoHeaderName};
use http::{HeaderMap, HeaderValue, Response, StatusCode};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::trace;

use crate::call::body::BodyControl;
use crate::call::{BodyWriter, ResponseBody, ResponsePusher};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResponseError {
    #[error("headers can no longer be set because response was already completed")]
    AlreadyCommitted,

    #[error("connection closed before the response could be delivered")]
    ConnectionClosed,
}

/// The mutable side of a call.
///
/// Status and headers can be changed until the response is committed by
/// [`respond`](Self::respond) or [`respond_streaming`](Self::respond_streaming).
/// Committing hands the response to the transport exactly once; any later
/// attempt to change it fails with [`ResponseError::AlreadyCommitted`].
///
/// A streaming body stays open until the call completes: the execution
/// closes it on success and aborts it on failure. Dropping the response
/// without either aborts it as well.
pub struct ApplicationResponse {
    status: StatusCode,
    headers: HeaderMap,
    committed: bool,
    sink: Option<oneshot::Sender<Response<ResponseBody>>>,
    body: Option<BodyControl>,
    pusher: Option<Arc<dyn ResponsePusher>>,
    body_capacity: usize,
}

impl ApplicationResponse {
    const DEFAULT_BODY_CAPACITY: usize = 16;

    /// A response whose committed form is delivered on the returned receiver.
    pub fn channel() -> (Self, oneshot::Receiver<Response<ResponseBody>>) {
        let (tx, rx) = oneshot::channel();
        let response = Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            committed: false,
            sink: Some(tx),
            body: None,
            pusher: None,
            body_capacity: Self::DEFAULT_BODY_CAPACITY,
        };
        (response, rx)
    }

    #[must_use]
    pub fn with_pusher(mut self, pusher: Arc<dyn ResponsePusher>) -> Self {
        self.pusher = Some(pusher);
        self
    }

    /// Buffer size, in chunks, of streaming bodies.
    #[must_use]
    pub fn with_body_capacity(mut self, capacity: usize) -> Self {
        self.body_capacity = capacity.max(1);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), ResponseError> {
        self.ensure_open()?;
        self.status = status;
        Ok(())
    }

    pub fn headers_mut(&mut self) -> Result<&mut HeaderMap, ResponseError> {
        self.ensure_open()?;
        Ok(&mut self.headers)
    }

    pub fn append_header<K: IntoHeaderName>(&mut self, name: K, value: HeaderValue) -> Result<(), ResponseError> {
        self.headers_mut()?.append(name, value);
        Ok(())
    }

    pub fn insert_header<K: IntoHeaderName>(&mut self, name: K, value: HeaderValue) -> Result<(), ResponseError> {
        self.headers_mut()?.insert(name, value);
        Ok(())
    }

    pub fn remove_header(&mut self, name: &HeaderName) -> Result<Option<HeaderValue>, ResponseError> {
        Ok(self.headers_mut()?.remove(name))
    }

    /// Commits the response with a complete body.
    pub fn respond(&mut self, body: impl Into<ResponseBody>) -> Result<(), ResponseError> {
        self.commit(body.into())
    }

    /// Commits status and headers now and returns a writer for the body.
    pub fn respond_streaming(&mut self) -> Result<BodyWriter, ResponseError> {
        self.ensure_open()?;
        let (writer, control, body) = ResponseBody::channel(self.body_capacity);
        self.commit(body)?;
        self.body = Some(control);
        Ok(writer)
    }

    /// Lets a streaming body end once its writers are dropped.
    pub(crate) fn close_body(&mut self) {
        if let Some(control) = self.body.take() {
            control.close();
        }
    }

    /// Fails a streaming body so the transport does not end it cleanly.
    pub(crate) fn abort_body(&mut self) {
        if let Some(control) = self.body.take() {
            trace!("aborting streaming response body");
            control.abort();
        }
    }

    pub(crate) fn pusher(&self) -> Option<&Arc<dyn ResponsePusher>> {
        self.pusher.as_ref()
    }

    fn commit(&mut self, body: ResponseBody) -> Result<(), ResponseError> {
        self.ensure_open()?;
        self.committed = true;

        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        trace!(status = %self.status, "response committed");

        let sink = self.sink.take().ok_or(ResponseError::ConnectionClosed)?;
        sink.send(response).map_err(|_response| ResponseError::ConnectionClosed)
    }

    fn ensure_open(&self) -> Result<(), ResponseError> {
        if self.committed { Err(ResponseError::AlreadyCommitted) } else { Ok(()) }
    }
}

impl Drop for ApplicationResponse {
    fn drop(&mut self) {
        self.abort_body();
    }
}

impl fmt::Debug for ApplicationResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("committed", &self.committed)
            .field("push", &self.pusher.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::BodyAborted;
    use http::header;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn respond_delivers_status_headers_and_body() {
        let (mut response, rx) = ApplicationResponse::channel();
        response.set_status(StatusCode::CREATED).unwrap();
        response.insert_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain")).unwrap();
        response.respond("created").unwrap();

        let delivered = rx.await.unwrap();
        assert_eq!(delivered.status(), StatusCode::CREATED);
        assert_eq!(delivered.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(delivered.into_body().collect().await.unwrap().to_bytes(), "created");
    }

    #[test]
    fn mutation_after_commit_fails() {
        let (mut response, _rx) = ApplicationResponse::channel();
        response.respond(()).unwrap();

        assert!(response.is_committed());
        assert_eq!(response.set_status(StatusCode::NOT_FOUND), Err(ResponseError::AlreadyCommitted));
        assert_eq!(
            response.append_header(header::SERVER, HeaderValue::from_static("micro-host")),
            Err(ResponseError::AlreadyCommitted)
        );
        assert_eq!(response.respond("again"), Err(ResponseError::AlreadyCommitted));
        assert_eq!(response.respond_streaming().err(), Some(ResponseError::AlreadyCommitted));
    }

    #[test]
    fn dropped_receiver_is_reported() {
        let (mut response, rx) = ApplicationResponse::channel();
        drop(rx);

        assert_eq!(response.respond("lost"), Err(ResponseError::ConnectionClosed));
        assert!(response.is_committed());
    }

    #[tokio::test]
    async fn streaming_body() {
        let (mut response, rx) = ApplicationResponse::channel();
        let writer = response.respond_streaming().unwrap();

        let delivered = rx.await.unwrap();
        writer.write("a").await.unwrap();
        writer.write("b").await.unwrap();
        drop(writer);
        response.close_body();

        assert_eq!(delivered.into_body().collect().await.unwrap().to_bytes(), "ab");
    }

    #[tokio::test]
    async fn streaming_body_stays_open_until_closed() {
        let (mut response, rx) = ApplicationResponse::channel();
        let writer = response.respond_streaming().unwrap();
        let mut body = rx.await.unwrap().into_body();
        writer.write("a").await.unwrap();
        drop(writer);

        assert_eq!(body.frame().await.unwrap().unwrap().into_data().unwrap(), "a");
        let next = tokio::time::timeout(std::time::Duration::from_millis(20), body.frame()).await;
        assert!(next.is_err(), "body ended before the call completed");
    }

    #[tokio::test]
    async fn dropping_the_response_aborts_a_streaming_body() {
        let (mut response, rx) = ApplicationResponse::channel();
        let writer = response.respond_streaming().unwrap();
        drop(writer);
        drop(response);

        let result = rx.await.unwrap().into_body().collect().await;
        assert!(matches!(result, Err(BodyAborted)));
    }
}
