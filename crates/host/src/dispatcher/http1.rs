use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use http::{Response, StatusCode};
use http_body::Body;
use http_body_util::BodyExt;
use micro_host_core::{
    Application, ApplicationCall, ApplicationRequest, ApplicationResponse, BodySender, CancelHandle, CancelReason, Pipeline,
    RequestBody, ResponseBody,
};
use micro_host_http::codec::{RequestDecoder, ResponseEncoder};
use micro_host_http::protocol::{HttpError, Message, ParseError, PayloadItem, PayloadSize, RequestHeader, ResponseHead, SendError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
use crate::dispatcher::run_call;

/// Serves the exchanges of one HTTP/1.1 connection, strictly in order.
///
/// Each request becomes one call executed on its own task. While the call
/// runs, the connection only decodes the current request's body. Input
/// arriving after it is buffered undecoded, up to `read_buffer_size` bytes,
/// so pipelined requests wait until the response has been written and
/// responses always go out in request order. Reading ahead also notices a
/// client that went away: unless `half_close` is set, end of input with
/// nothing buffered cancels the in-flight call.
#[derive(Debug)]
pub struct Http1Connection<R, W> {
    framed_read: FramedRead<R, RequestDecoder>,
    framed_write: FramedWrite<W, ResponseEncoder>,
    remote_addr: Option<SocketAddr>,
    config: Arc<HostConfig>,
}

impl<R, W> Http1Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, config: Arc<HostConfig>) -> Self {
        Self {
            framed_read: FramedRead::with_capacity(reader, RequestDecoder::new(), config.read_buffer_size),
            framed_write: FramedWrite::new(writer, ResponseEncoder::new()),
            remote_addr: None,
            config,
        }
    }

    #[must_use]
    pub fn with_remote_addr(mut self, remote_addr: SocketAddr) -> Self {
        self.remote_addr = Some(remote_addr);
        self
    }

    pub async fn process(mut self, application: Arc<Application>, host_pipeline: Arc<Pipeline>) -> Result<(), HttpError> {
        loop {
            match self.framed_read.next().await {
                Some(Ok(Message::Header((header, payload_size)))) => {
                    let keep_alive = self.do_process(header, payload_size, &application, &host_pipeline).await?;
                    if !keep_alive {
                        info!("connection not kept alive, closing");
                        return Ok(());
                    }
                }

                Some(Ok(Message::Payload(_))) => {
                    error!("received a body chunk while waiting for a request head");
                    self.do_send_response(build_error_response(StatusCode::BAD_REQUEST)).await?;
                    return Err(ParseError::invalid_body("need header while receive body").into());
                }

                Some(Err(e)) => {
                    error!(cause = %e, "can't receive next request");
                    self.do_send_response(build_error_response(StatusCode::BAD_REQUEST)).await?;
                    return Err(e.into());
                }

                None => {
                    info!("cant read more request, break this connection down");
                    return Ok(());
                }
            }
        }
    }

    /// Runs one exchange and returns whether the connection can carry
    /// another one.
    async fn do_process(
        &mut self,
        header: RequestHeader,
        payload_size: PayloadSize,
        application: &Arc<Application>,
        host_pipeline: &Arc<Pipeline>,
    ) -> Result<bool, HttpError> {
        if header.expects_continue() {
            let writer = self.framed_write.get_mut();
            writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.map_err(SendError::io)?;
            writer.flush().await.map_err(SendError::io)?;
            info!("receive expect request header, sent continue response");
        }

        let keep_alive = header.is_keep_alive();
        let (body_sender, body) = if payload_size.is_empty() {
            (None, RequestBody::empty())
        } else {
            let (tx, body) = RequestBody::channel(self.config.body_channel_capacity);
            (Some(tx), body)
        };

        let request = ApplicationRequest::new(header, body).with_remote_addr(self.remote_addr);
        let (response, mut response_rx) = ApplicationResponse::channel();
        let response = response.with_body_capacity(self.config.response_channel_capacity);
        let call = ApplicationCall::new(Arc::clone(application), request, response);

        let cancel = CancelHandle::new();
        let task = {
            let host_pipeline = Arc::clone(host_pipeline);
            let cancel = cancel.clone();
            let timeout = self.config.call_timeout();
            tokio::spawn(async move { run_call(call, &host_pipeline, cancel, timeout).await })
        };

        let mut pump = BodyPump {
            framed_read: &mut self.framed_read,
            sender: body_sender,
            eof: false,
            skipped: 0,
            body_result: None,
            pending_input: BytesMut::with_capacity(1024),
            read_closed: false,
            read_ahead_limit: self.config.read_buffer_size,
            half_close: self.config.half_close,
        };

        // The call may need its body before it responds, so the body keeps
        // flowing while we wait for the response head.
        let response = loop {
            select! {
                biased;
                response = &mut response_rx => break response.ok(),
                () = pump.drive(&cancel) => {}
            }
        };

        let responded = response.is_some();
        let mut send_result = Ok(());
        if let Some(response) = response {
            let write = do_send_response(&mut self.framed_write, response);
            tokio::pin!(write);
            send_result = loop {
                select! {
                    biased;
                    result = &mut write => break result,
                    () = pump.drive(&cancel) => {}
                }
            };
        } else {
            warn!("call ended without a response");
        }

        // skip body if the call didn't read all of it
        let body_result = match pump.body_result.take() {
            Some(result) => result,
            None => pump.forward().await,
        };
        if pump.skipped > 0 {
            debug!(bytes = pump.skipped, "discarded unread request body");
        }

        if let Err(e) = &send_result {
            cancel.cancel(CancelReason::ConnectionClosed);
            error!(cause = %e, "failed to send response");
        }

        match task.await {
            Ok(outcome) => debug!(?outcome, "call completed"),
            Err(e) => error!(cause = %e, "call task failed"),
        }

        send_result?;
        let request_complete = match body_result {
            Err(e) => {
                warn!(cause = %e, "request body could not be read, closing connection");
                false
            }
            Ok(()) => true,
        };
        let residual = self.framed_read.read_buffer().len();
        if residual > 0 {
            debug!(bytes = residual, "input pending for the next exchange");
        }

        Ok(keep_alive && request_complete && responded)
    }

    async fn do_send_response(&mut self, response: Response<ResponseBody>) -> Result<(), HttpError> {
        do_send_response(&mut self.framed_write, response).await
    }
}

/// Moves one request's body from the decoder into the call, then buffers
/// whatever follows it.
struct BodyPump<'a, R> {
    framed_read: &'a mut FramedRead<R, RequestDecoder>,
    sender: Option<BodySender>,
    eof: bool,
    skipped: usize,
    body_result: Option<Result<(), ParseError>>,
    pending_input: BytesMut,
    read_closed: bool,
    read_ahead_limit: usize,
    half_close: bool,
}

impl<R> BodyPump<'_, R>
where
    R: AsyncRead + Unpin,
{
    /// Forwards chunks until the body ends. Once the call drops its body the
    /// remaining chunks are read and discarded.
    ///
    /// Cancel safe: a chunk is only taken from the decoder once the call has
    /// room for it.
    async fn forward(&mut self) -> Result<(), ParseError> {
        while !self.eof {
            if self.sender.as_ref().is_some_and(BodySender::is_closed) {
                debug!("request body dropped by the call, discarding the rest");
                self.sender = None;
            }

            let permit = match &self.sender {
                Some(sender) => sender.reserve().await.ok(),
                None => None,
            };

            match self.framed_read.next().await {
                Some(Ok(Message::Payload(PayloadItem::Chunk(bytes)))) => match permit {
                    Some(permit) => permit.send(Ok(bytes)),
                    None => self.skipped += bytes.len(),
                },
                Some(Ok(Message::Payload(PayloadItem::Eof))) => {
                    drop(permit);
                    self.eof = true;
                    self.sender = None;
                }
                Some(Ok(Message::Header(_))) => {
                    self.eof = true;
                    if let Some(permit) = permit {
                        permit.send(Err(ParseError::invalid_body("request head inside a body")));
                    }
                    return Err(ParseError::invalid_body("request head inside a body"));
                }
                Some(Err(e)) => {
                    self.eof = true;
                    if let Some(permit) = permit {
                        permit.send(Err(ParseError::invalid_body(&e)));
                    }
                    return Err(e);
                }
                None => {
                    self.eof = true;
                    if let Some(permit) = permit {
                        permit.send(Err(ParseError::UnexpectedEof));
                    }
                    return Err(ParseError::UnexpectedEof);
                }
            }
        }
        self.sender = None;
        Ok(())
    }

    /// Makes progress on the input side of the exchange: forwards the body
    /// while there is one, then buffers what follows it. Never resolves once
    /// there is nothing left to read.
    ///
    /// Cancel safe, like [`forward`](Self::forward) and
    /// [`read_ahead`](Self::read_ahead).
    async fn drive(&mut self, cancel: &CancelHandle) {
        if self.body_result.is_none() {
            let result = self.forward().await;
            if result.as_ref().is_err_and(is_connection_lost) {
                cancel.cancel(CancelReason::ConnectionClosed);
            }
            self.body_result = Some(result);
        } else if self.can_read_ahead() {
            let result = self.read_ahead().await;
            self.on_read_ahead(result, cancel);
        } else {
            std::future::pending::<()>().await;
        }
    }

    fn can_read_ahead(&self) -> bool {
        matches!(self.body_result, Some(Ok(())))
            && !self.read_closed
            && self.framed_read.read_buffer().len() < self.read_ahead_limit
    }

    /// Reads raw input into the decoder's buffer without decoding it.
    ///
    /// Bytes move into the decoder's buffer in the same poll that read them.
    async fn read_ahead(&mut self) -> std::io::Result<usize> {
        let read = self.framed_read.get_mut().read_buf(&mut self.pending_input).await?;
        self.framed_read.read_buffer_mut().extend_from_slice(&self.pending_input);
        self.pending_input.clear();
        Ok(read)
    }

    fn on_read_ahead(&mut self, result: std::io::Result<usize>, cancel: &CancelHandle) {
        match result {
            Ok(0) => {
                self.read_closed = true;
                let pending = self.framed_read.read_buffer().len();
                if self.half_close || pending > 0 {
                    debug!(pending, "client closed its side, finishing the exchange");
                } else {
                    info!("client closed the connection mid-exchange, cancelling the call");
                    cancel.cancel(CancelReason::ConnectionClosed);
                }
            }
            Ok(read) => debug!(bytes = read, "buffered input for the next exchange"),
            Err(e) => {
                self.read_closed = true;
                warn!(cause = %e, "reading ahead failed, cancelling the call");
                cancel.cancel(CancelReason::ConnectionClosed);
            }
        }
    }
}

async fn do_send_response<W, T>(framed_write: &mut FramedWrite<W, ResponseEncoder>, response: Response<T>) -> Result<(), HttpError>
where
    W: AsyncWrite + Unpin,
    T: Body<Data = Bytes> + Unpin,
    T::Error: std::fmt::Display,
{
    let (header_parts, mut body) = response.into_parts();

    let payload_size = PayloadSize::from_exact(body.size_hint().exact());

    let header = Message::<_, Bytes>::Header((ResponseHead::from_parts(header_parts, ()), payload_size));
    if payload_size.is_empty() {
        // using send instead of feed, because we want to flush the underlying IO
        // when response only has header
        framed_write.send(header).await?;
    } else {
        framed_write.feed(header).await?;
    }

    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                let Ok(chunk) = frame.into_data() else {
                    // trailers are not sent over HTTP/1.1
                    continue;
                };
                framed_write.send(Message::Payload(PayloadItem::Chunk(chunk))).await?;
            }
            Some(Err(e)) => return Err(SendError::invalid_body(format!("resolve response body error: {e}")).into()),
            None => {
                framed_write.send(Message::Payload(PayloadItem::<Bytes>::Eof)).await?;
                return Ok(());
            }
        }
    }
}

fn is_connection_lost(e: &ParseError) -> bool {
    matches!(e, ParseError::UnexpectedEof | ParseError::Io { .. })
}

fn build_error_response(status_code: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(ResponseBody::empty());
    *response.status_mut() = status_code;
    response
}
