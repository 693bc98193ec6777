//! Request and response bodies exchanged between the transport and a call.
//!
//! Both directions are bounded tokio channels: the transport pushes request
//! chunks as they are decoded and the call pulls them through
//! [`http_body::Body`], while a streaming response hands chunks back through
//! a [`BodyWriter`]. A full channel suspends the producer, which is how
//! backpressure reaches the connection.
//!
//! A streaming response body only ends cleanly once its call completed
//! successfully. When the call fails it yields [`BodyAborted`] instead, so
//! the transport can tell a truncated body from a complete one.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use micro_host_http::protocol::ParseError;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::call::ResponseError;

/// Producer side of a [`RequestBody`], owned by the transport.
pub type BodySender = mpsc::Sender<Result<Bytes, ParseError>>;

#[derive(Debug)]
pub struct RequestBody {
    kind: RequestKind,
}

#[derive(Debug)]
enum RequestKind {
    Empty,
    Channel(mpsc::Receiver<Result<Bytes, ParseError>>),
}

impl RequestBody {
    pub fn empty() -> Self {
        Self { kind: RequestKind::Empty }
    }

    /// A body fed chunk by chunk through the returned sender. Dropping the
    /// sender ends the body.
    pub fn channel(capacity: usize) -> (BodySender, RequestBody) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { kind: RequestKind::Channel(rx) })
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = ParseError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().kind {
            RequestKind::Empty => Poll::Ready(None),
            RequestKind::Channel(rx) => rx.poll_recv(cx).map(|item| item.map(|result| result.map(Frame::data))),
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.kind, RequestKind::Empty)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("response body aborted because the call failed")]
pub struct BodyAborted;

/// The body of a committed response.
#[derive(Debug)]
pub struct ResponseBody {
    kind: ResponseKind,
}

enum ResponseKind {
    Once(Option<Bytes>),
    Channel { rx: mpsc::Receiver<Bytes>, aborted: Pin<Box<WaitForCancellationFutureOwned>>, abort: CancellationToken },
}

impl fmt::Debug for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseKind::Once(bytes) => f.debug_tuple("Once").field(bytes).finish(),
            ResponseKind::Channel { abort, .. } => {
                f.debug_struct("Channel").field("aborted", &abort.is_cancelled()).finish_non_exhaustive()
            }
        }
    }
}

/// The response's own handle on a streaming body.
///
/// Holding a sender keeps the body open after every [`BodyWriter`] is gone,
/// until the call's outcome decides how the body ends.
#[derive(Debug)]
pub(crate) struct BodyControl {
    tx: mpsc::Sender<Bytes>,
    abort: CancellationToken,
}

impl BodyControl {
    /// Ends the body once every writer is dropped.
    pub(crate) fn close(self) {
        drop(self.tx);
    }

    /// Fails the body, discarding chunks the transport has not taken yet.
    pub(crate) fn abort(self) {
        self.abort.cancel();
    }
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self { kind: ResponseKind::Once(None) }
    }

    pub fn once(bytes: Bytes) -> Self {
        if bytes.is_empty() { Self::empty() } else { Self { kind: ResponseKind::Once(Some(bytes)) } }
    }

    pub(crate) fn channel(capacity: usize) -> (BodyWriter, BodyControl, ResponseBody) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let abort = CancellationToken::new();
        let aborted = Box::pin(abort.clone().cancelled_owned());
        let control = BodyControl { tx: tx.clone(), abort: abort.clone() };
        (BodyWriter { tx }, control, Self { kind: ResponseKind::Channel { rx, aborted, abort } })
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        Self::once(bytes)
    }
}

impl From<String> for ResponseBody {
    fn from(value: String) -> Self {
        Self::once(Bytes::from(value))
    }
}

impl From<&'static str> for ResponseBody {
    fn from(value: &'static str) -> Self {
        Self::once(Bytes::from_static(value.as_bytes()))
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(value: Vec<u8>) -> Self {
        Self::once(Bytes::from(value))
    }
}

impl From<()> for ResponseBody {
    fn from((): ()) -> Self {
        Self::empty()
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = BodyAborted;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().kind {
            ResponseKind::Once(bytes) => Poll::Ready(bytes.take().map(|bytes| Ok(Frame::data(bytes)))),
            ResponseKind::Channel { rx, aborted, abort } => {
                if aborted.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Some(Err(BodyAborted)));
                }
                match rx.poll_recv(cx) {
                    Poll::Ready(Some(bytes)) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
                    Poll::Ready(None) if abort.is_cancelled() => Poll::Ready(Some(Err(BodyAborted))),
                    Poll::Ready(None) => Poll::Ready(None),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.kind, ResponseKind::Once(None))
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            ResponseKind::Once(None) => SizeHint::with_exact(0),
            ResponseKind::Once(Some(bytes)) => SizeHint::with_exact(bytes.len() as u64),
            ResponseKind::Channel { .. } => SizeHint::default(),
        }
    }
}

/// Writes the chunks of a streaming response.
///
/// The body ends once every writer is dropped and the call has completed.
#[derive(Debug, Clone)]
pub struct BodyWriter {
    tx: mpsc::Sender<Bytes>,
}

impl BodyWriter {
    /// Sends one chunk, waiting while the transport is behind.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<(), ResponseError> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx.send(chunk).await.map_err(|_closed| ResponseError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn request_body_yields_sent_chunks() {
        let (tx, body) = RequestBody::channel(4);
        tx.send(Ok(Bytes::from_static(b"hello "))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"world"))).await.unwrap();
        drop(tx);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn request_body_surfaces_transport_errors() {
        let (tx, body) = RequestBody::channel(1);
        tx.send(Err(ParseError::UnexpectedEof)).await.unwrap();

        assert!(matches!(body.collect().await, Err(ParseError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn streaming_response_has_unknown_size() {
        let (writer, control, body) = ResponseBody::channel(2);
        assert_eq!(body.size_hint().exact(), None);

        writer.write("chunk").await.unwrap();
        drop(writer);
        control.close();

        assert_eq!(body.collect().await.unwrap().to_bytes(), Bytes::from_static(b"chunk"));
    }

    #[tokio::test]
    async fn aborted_streaming_response_fails_instead_of_ending() {
        let (writer, control, mut body) = ResponseBody::channel(2);
        writer.write("partial").await.unwrap();
        drop(writer);
        control.abort();

        assert!(matches!(body.frame().await, Some(Err(BodyAborted))));
    }

    #[tokio::test]
    async fn abort_wakes_a_waiting_body() {
        let (_writer, control, mut body) = ResponseBody::channel(2);
        let reader = tokio::spawn(async move { body.frame().await.map(|frame| frame.is_err()) });
        tokio::task::yield_now().await;
        control.abort();

        assert_eq!(reader.await.unwrap(), Some(true));
    }

    #[test]
    fn once_body_size() {
        assert_eq!(ResponseBody::from("abc").size_hint().exact(), Some(3));
        assert_eq!(ResponseBody::from("").size_hint().exact(), Some(0));
        assert!(ResponseBody::empty().is_end_stream());
    }
}
