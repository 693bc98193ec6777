//! HTTP/2 dispatch: one call per stream, many streams per connection.
//!
//! The framing layer feeds decoded [`Http2Frame`]s into
//! [`Http2Dispatcher::on_frame`] and drains the [`Http2Command`]s it emits.
//! Every open stream has an entry in the stream table holding the inbox of
//! its request body, its receive window and the cancel handle of its
//! execution. The entry is removed when the stream's call is over or when
//! the peer resets the stream, whichever comes first.
//!
//! Received DATA is queued in the inbox and moved into the call's body by a
//! per-stream forwarder. The peer's window is reopened, with
//! [`Http2Command::WindowUpdate`], for every chunk the call has taken, so
//! the inbox never holds more than one window of data.

use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::{Stream, StreamExt};
use http::Response;
use http_body_util::BodyExt;
use micro_host_core::{
    Application, ApplicationCall, ApplicationRequest, ApplicationResponse, BodySender, CancelHandle, CancelReason, Pipeline,
    PushBuilder, PushError, RequestBody, ResponseBody, ResponsePusher,
};
use micro_host_http::protocol::{Http2Command, Http2Frame, Reason, RequestHeader, ResponseHead, StreamHeaders, StreamId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
use crate::dispatcher::run_call;

/// Highest stream id HTTP/2 allows.
const MAX_STREAM_ID: StreamId = (1 << 31) - 1;

/// Dispatches the streams of one HTTP/2 connection.
///
/// [`on_frame`](Self::on_frame) never blocks, so the framing layer can keep
/// reading while calls run: every stream's call runs on its own task.
#[derive(Debug, Clone)]
pub struct Http2Dispatcher {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    application: Arc<Application>,
    host_pipeline: Arc<Pipeline>,
    config: Arc<HostConfig>,
    commands: mpsc::UnboundedSender<Http2Command>,
    streams: DashMap<StreamId, StreamEntry>,
    next_push_id: AtomicU32,
    last_client_stream_id: AtomicU32,
    going_away: AtomicBool,
}

#[derive(Debug)]
struct StreamEntry {
    /// `None` once the peer ended its side of the stream
    inbox: Option<mpsc::UnboundedSender<Bytes>>,
    /// bytes the peer may still send before the window is reopened
    recv_window: u32,
    cancel: CancelHandle,
}

/// Orders `PUSH_PROMISE` frames against the end of the stream they are
/// promised on: once the origin response has ended, no promise follows.
#[derive(Debug, Default)]
struct PromiseGate {
    ended: Mutex<bool>,
}

impl PromiseGate {
    /// Runs `send` if the origin response is still open. `None` when it is not.
    fn send_if_open(&self, send: impl FnOnce() -> bool) -> Option<bool> {
        let ended = self.ended.lock().unwrap_or_else(PoisonError::into_inner);
        if *ended { None } else { Some(send()) }
    }

    /// Marks the origin response as ended and runs `send`, the last frame.
    fn end_with(&self, send: impl FnOnce() -> bool) -> bool {
        let mut ended = self.ended.lock().unwrap_or_else(PoisonError::into_inner);
        *ended = true;
        send()
    }
}

enum DataAction {
    Delivered,
    Overflow,
    AfterEnd,
}

impl Http2Dispatcher {
    /// Creates a dispatcher and the receiver the framing layer drains
    /// commands from.
    pub fn new(
        application: Arc<Application>,
        host_pipeline: Arc<Pipeline>,
        config: Arc<HostConfig>,
    ) -> (Self, mpsc::UnboundedReceiver<Http2Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            application,
            host_pipeline,
            config,
            commands,
            streams: DashMap::new(),
            next_push_id: AtomicU32::new(2),
            last_client_stream_id: AtomicU32::new(0),
            going_away: AtomicBool::new(false),
        };
        (Self { shared: Arc::new(shared) }, rx)
    }

    /// Feeds every frame of `frames` to the dispatcher, then closes it.
    pub async fn process<S>(self, mut frames: S)
    where
        S: Stream<Item = Http2Frame> + Unpin,
    {
        while let Some(frame) = frames.next().await {
            self.on_frame(frame);
        }
        self.close();
    }

    /// Routes one inbound frame. Must be called from within a tokio runtime.
    pub fn on_frame(&self, frame: Http2Frame) {
        match frame {
            Http2Frame::Headers { stream_id, headers, end_stream } => {
                if self.shared.streams.contains_key(&stream_id) {
                    self.on_trailers(stream_id, end_stream);
                } else {
                    self.open_stream(stream_id, headers, end_stream);
                }
            }
            Http2Frame::Data { stream_id, data, end_stream } => self.on_data(stream_id, data, end_stream),
            Http2Frame::RstStream { stream_id, reason } => match self.shared.streams.remove(&stream_id) {
                Some((_, entry)) => {
                    debug!(stream_id, %reason, "stream reset by peer");
                    entry.cancel.cancel(CancelReason::StreamReset { stream_id, reason });
                }
                None => debug!(stream_id, %reason, "reset for a stream that is already closed"),
            },
            Http2Frame::GoAway { last_stream_id, reason } => self.on_go_away(last_stream_id, reason),
        }
    }

    /// The connection is gone: cancels every open stream.
    pub fn close(&self) {
        self.shared.going_away.store(true, Ordering::Release);
        let stream_ids: Vec<StreamId> = self.shared.streams.iter().map(|entry| *entry.key()).collect();
        for stream_id in stream_ids {
            if let Some((_, entry)) = self.shared.streams.remove(&stream_id) {
                entry.cancel.cancel(CancelReason::ConnectionClosed);
            }
        }
        info!("http2 connection closed");
    }

    pub fn open_streams(&self) -> usize {
        self.shared.streams.len()
    }

    pub fn is_open(&self, stream_id: StreamId) -> bool {
        self.shared.streams.contains_key(&stream_id)
    }

    fn open_stream(&self, stream_id: StreamId, headers: StreamHeaders, end_stream: bool) {
        if stream_id == 0 || stream_id % 2 == 0 {
            warn!(stream_id, "client opened a stream with an even id");
            self.shared.reset(stream_id, Reason::PROTOCOL_ERROR);
            return;
        }
        if self.shared.last_client_stream_id.fetch_max(stream_id, Ordering::AcqRel) >= stream_id {
            // ids only grow, a lower one belongs to a stream that is over
            self.on_unknown_stream(stream_id);
            return;
        }
        if self.shared.going_away.load(Ordering::Acquire) {
            debug!(stream_id, "connection going away, refusing stream");
            self.shared.reset(stream_id, Reason::REFUSED_STREAM);
            return;
        }
        if self.shared.streams.len() >= self.shared.config.max_concurrent_streams {
            warn!(stream_id, limit = self.shared.config.max_concurrent_streams, "too many open streams, refusing");
            self.shared.reset(stream_id, Reason::REFUSED_STREAM);
            return;
        }

        let header = match headers.into_request_header() {
            Ok(header) => header,
            Err(e) => {
                warn!(stream_id, cause = %e, "malformed request headers");
                self.shared.reset(stream_id, Reason::PROTOCOL_ERROR);
                return;
            }
        };
        Shared::start_stream(&self.shared, stream_id, header, end_stream, true);
    }

    fn on_trailers(&self, stream_id: StreamId, end_stream: bool) {
        debug!(stream_id, "received trailers");
        if end_stream && let Some(mut entry) = self.shared.streams.get_mut(&stream_id) {
            entry.inbox = None;
        }
    }

    fn on_data(&self, stream_id: StreamId, data: Bytes, end_stream: bool) {
        let action = {
            let Some(mut entry) = self.shared.streams.get_mut(&stream_id) else {
                self.on_unknown_stream(stream_id);
                return;
            };
            let len = data.len();
            let action = match u32::try_from(len) {
                _ if entry.inbox.is_none() => DataAction::AfterEnd,
                Ok(len) if len <= entry.recv_window => {
                    entry.recv_window -= len;
                    if let Some(inbox) = &entry.inbox
                        && inbox.send(data).is_err()
                    {
                        debug!(stream_id, "request body forwarder is gone, discarding data");
                    }
                    DataAction::Delivered
                }
                _ => DataAction::Overflow,
            };
            if end_stream {
                entry.inbox = None;
            }
            action
        };

        match action {
            DataAction::Delivered => {}
            DataAction::Overflow => {
                warn!(stream_id, "peer sent more data than the stream window allows");
                self.abort_stream(stream_id, Reason::FLOW_CONTROL_ERROR);
            }
            DataAction::AfterEnd => {
                warn!(stream_id, "data after end of stream");
                self.abort_stream(stream_id, Reason::STREAM_CLOSED);
            }
        }
    }

    fn on_unknown_stream(&self, stream_id: StreamId) {
        warn!(stream_id, "received frame for unknown stream");
        if self.shared.config.reset_unknown_streams {
            self.shared.reset(stream_id, Reason::STREAM_CLOSED);
        }
    }

    /// Resets a stream from our side and cancels its call.
    fn abort_stream(&self, stream_id: StreamId, reason: Reason) {
        if let Some((_, entry)) = self.shared.streams.remove(&stream_id) {
            entry.cancel.cancel(CancelReason::StreamReset { stream_id, reason });
        }
        self.shared.reset(stream_id, reason);
    }

    fn on_go_away(&self, last_stream_id: StreamId, reason: Reason) {
        info!(last_stream_id, %reason, "peer is going away");
        self.shared.going_away.store(true, Ordering::Release);
        if reason != Reason::NO_ERROR {
            self.close();
            return;
        }

        // pushed streams the peer never saw are abandoned
        let abandoned: Vec<StreamId> =
            self.shared.streams.iter().map(|entry| *entry.key()).filter(|id| id % 2 == 0 && *id > last_stream_id).collect();
        for stream_id in abandoned {
            if let Some((_, entry)) = self.shared.streams.remove(&stream_id) {
                entry.cancel.cancel(CancelReason::ConnectionClosed);
            }
        }
    }
}

impl Shared {
    fn send(&self, command: Http2Command) -> bool {
        self.commands.send(command).is_ok()
    }

    fn reset(&self, stream_id: StreamId, reason: Reason) {
        self.send(Http2Command::RstStream { stream_id, reason });
    }

    /// Registers the stream and spawns its call.
    fn start_stream(shared: &Arc<Shared>, stream_id: StreamId, header: RequestHeader, end_stream: bool, can_push: bool) {
        let (forwarder, inbox, body) = if end_stream {
            (None, None, RequestBody::empty())
        } else {
            let (tx, body) = RequestBody::channel(shared.config.body_channel_capacity);
            let (inbox, queued) = mpsc::unbounded_channel();
            (Some((queued, tx)), Some(inbox), body)
        };

        let cancel = CancelHandle::new();
        match shared.streams.entry(stream_id) {
            Entry::Occupied(_) => {
                error!(stream_id, "stream is already open");
                return;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StreamEntry { inbox, recv_window: shared.config.initial_window_size, cancel: cancel.clone() });
            }
        }
        if let Some((queued, tx)) = forwarder {
            tokio::spawn(forward_body(Arc::clone(shared), stream_id, queued, tx));
        }

        let request = ApplicationRequest::new(header, body);
        let request = match request.uri().scheme_str() {
            Some("http") => request.with_scheme("http"),
            _ => request.with_scheme("https"),
        };
        let (response, response_rx) = ApplicationResponse::channel();
        let mut response = response.with_body_capacity(shared.config.response_channel_capacity);
        let gate = Arc::new(PromiseGate::default());
        if can_push && shared.config.push_enabled {
            let pusher = Http2Pusher { shared: Arc::clone(shared), stream_id, gate: Arc::clone(&gate) };
            response = response.with_pusher(Arc::new(pusher));
        }
        let call = ApplicationCall::new(Arc::clone(&shared.application), request, response);

        tokio::spawn(run_stream(Arc::clone(shared), stream_id, call, response_rx, cancel, gate));
    }

    /// Reopens the windows for `len` bytes the call has taken.
    fn release_window(&self, stream_id: StreamId, len: usize) {
        let Ok(increment) = u32::try_from(len) else {
            return;
        };
        if increment == 0 {
            return;
        }

        let stream_open = match self.streams.get_mut(&stream_id) {
            Some(mut entry) if entry.inbox.is_some() => {
                entry.recv_window = entry.recv_window.saturating_add(increment);
                true
            }
            _ => false,
        };
        if stream_open {
            self.send(Http2Command::WindowUpdate { stream_id, increment });
        }
        self.send(Http2Command::WindowUpdate { stream_id: 0, increment });
    }
}

/// Moves received DATA from a stream's inbox into its call's body.
///
/// Once the call drops its body the remaining data is discarded, and the
/// window still reopened for it.
async fn forward_body(shared: Arc<Shared>, stream_id: StreamId, mut queued: mpsc::UnboundedReceiver<Bytes>, body: BodySender) {
    let mut body = Some(body);
    while let Some(data) = queued.recv().await {
        let len = data.len();
        if let Some(sender) = &body
            && sender.send(Ok(data)).await.is_err()
        {
            debug!(stream_id, "request body dropped by the call, discarding data");
            body = None;
        }
        shared.release_window(stream_id, len);
    }
}

async fn run_stream(
    shared: Arc<Shared>,
    stream_id: StreamId,
    call: ApplicationCall,
    response_rx: oneshot::Receiver<Response<ResponseBody>>,
    cancel: CancelHandle,
    gate: Arc<PromiseGate>,
) {
    let (outcome, ()) = tokio::join!(
        run_call(call, &shared.host_pipeline, cancel.clone(), shared.config.call_timeout()),
        send_response(&shared, stream_id, response_rx, &cancel, &gate),
    );
    debug!(stream_id, ?outcome, "stream completed");
    shared.streams.remove(&stream_id);
}

/// Writes the committed response as `HEADERS` and `DATA` commands.
///
/// A body that fails midway resets the stream with `INTERNAL_ERROR` instead
/// of ending it.
async fn send_response(
    shared: &Shared,
    stream_id: StreamId,
    response_rx: oneshot::Receiver<Response<ResponseBody>>,
    cancel: &CancelHandle,
    gate: &PromiseGate,
) {
    let Ok(response) = response_rx.await else {
        debug!(stream_id, "stream ended without a response");
        gate.end_with(|| true);
        return;
    };

    let (parts, mut body) = response.into_parts();
    let end_stream = http_body::Body::is_end_stream(&body);
    let head = ResponseHead::from_parts(parts, ());
    let headers = Http2Command::Headers { stream_id, head, end_stream };
    let sent = if end_stream { gate.end_with(|| shared.send(headers)) } else { shared.send(headers) };
    if !sent {
        cancel.cancel(CancelReason::ConnectionClosed);
        return;
    }
    if end_stream {
        return;
    }

    // hold one chunk back so the last DATA frame can carry END_STREAM
    let mut pending: Option<Bytes> = None;
    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(stream_id, cause = %e, "response body failed, resetting stream");
                gate.end_with(|| shared.send(Http2Command::RstStream { stream_id, reason: Reason::INTERNAL_ERROR }));
                return;
            }
        };
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if let Some(previous) = pending.replace(data)
            && !shared.send(Http2Command::Data { stream_id, data: previous, end_stream: false })
        {
            cancel.cancel(CancelReason::ConnectionClosed);
            return;
        }
        if cancel.is_cancelled() {
            return;
        }
    }

    let data = pending.unwrap_or_default();
    if !gate.end_with(|| shared.send(Http2Command::Data { stream_id, data, end_stream: true })) {
        cancel.cancel(CancelReason::ConnectionClosed);
    }
}

/// Pushes resources on behalf of the call running on `stream_id`.
#[derive(Debug)]
struct Http2Pusher {
    shared: Arc<Shared>,
    stream_id: StreamId,
    gate: Arc<PromiseGate>,
}

impl Http2Pusher {
    fn next_push_id(&self) -> Result<StreamId, PushError> {
        let promised = self.shared.next_push_id.fetch_add(2, Ordering::AcqRel);
        if promised > MAX_STREAM_ID {
            return Err(PushError::invalid_target("server stream ids exhausted"));
        }
        Ok(promised)
    }
}

impl ResponsePusher for Http2Pusher {
    fn push(&self, call: &ApplicationCall, builder: PushBuilder) -> Result<(), PushError> {
        if !self.shared.config.push_enabled {
            return Err(PushError::Disabled);
        }
        if self.shared.going_away.load(Ordering::Acquire) {
            return Err(PushError::ConnectionClosed);
        }

        let headers = builder.into_stream_headers(call.request())?;
        let header = headers.clone().into_request_header().map_err(PushError::invalid_target)?;
        let promised_stream_id = self.next_push_id()?;

        let promise = Http2Command::PushPromise { stream_id: self.stream_id, promised_stream_id, headers };
        match self.gate.send_if_open(|| self.shared.send(promise)) {
            Some(true) => {}
            Some(false) => return Err(PushError::ConnectionClosed),
            None => {
                debug!(stream_id = self.stream_id, "origin response already ended, refusing push");
                return Err(PushError::ConnectionClosed);
            }
        }
        debug!(stream_id = self.stream_id, promised_stream_id, path = header.uri().path(), "promised push");

        Shared::start_stream(&self.shared, promised_stream_id, header, true, false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promises_are_refused_once_the_origin_ended() {
        let gate = PromiseGate::default();
        assert_eq!(gate.send_if_open(|| true), Some(true));
        assert!(gate.end_with(|| true));

        let mut sent = false;
        assert_eq!(
            gate.send_if_open(|| {
                sent = true;
                true
            }),
            None
        );
        assert!(!sent);
    }
}
