//! HTTP/2 stream events, modelled above the binary framing and HPACK layer.
//!
//! The framing layer hands the dispatcher decoded [`Http2Frame`]s and drains
//! the [`Http2Command`]s it emits. Header blocks arrive already decompressed
//! as [`StreamHeaders`].

use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Uri, Version};

use crate::protocol::{ParseError, RequestHeader, ResponseHead};

pub type StreamId = u32;

/// Flow-control window every stream starts with, unless `SETTINGS` change it.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// An HTTP/2 error code, as carried by `RST_STREAM` and `GOAWAY`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reason(u32);

impl Reason {
    pub const NO_ERROR: Reason = Reason(0);
    pub const PROTOCOL_ERROR: Reason = Reason(1);
    pub const INTERNAL_ERROR: Reason = Reason(2);
    pub const FLOW_CONTROL_ERROR: Reason = Reason(3);
    pub const STREAM_CLOSED: Reason = Reason(5);
    pub const REFUSED_STREAM: Reason = Reason(7);
    pub const CANCEL: Reason = Reason(8);

    pub const fn from_code(code: u32) -> Self {
        Reason(code)
    }

    pub const fn code(self) -> u32 {
        self.0
    }

    fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0 => "NO_ERROR",
            1 => "PROTOCOL_ERROR",
            2 => "INTERNAL_ERROR",
            3 => "FLOW_CONTROL_ERROR",
            4 => "SETTINGS_TIMEOUT",
            5 => "STREAM_CLOSED",
            6 => "FRAME_SIZE_ERROR",
            7 => "REFUSED_STREAM",
            8 => "CANCEL",
            9 => "COMPRESSION_ERROR",
            10 => "CONNECT_ERROR",
            11 => "ENHANCE_YOUR_CALM",
            12 => "INADEQUATE_SECURITY",
            13 => "HTTP_1_1_REQUIRED",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "unknown error code {:#x}", self.0),
        }
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A decoded request header block: the pseudo headers plus regular fields.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHeaders {
    pub method: Method,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: String,
    pub headers: HeaderMap,
}

impl StreamHeaders {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, scheme: None, authority: None, path: path.into(), headers: HeaderMap::new() }
    }

    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    #[must_use]
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    /// Converts the header block into a request head.
    ///
    /// `:path` is mandatory and must be origin-form (or `*`); when both
    /// `:scheme` and `:authority` are present the resulting URI is absolute.
    pub fn into_request_header(self) -> Result<RequestHeader, ParseError> {
        if self.path.is_empty() || !(self.path.starts_with('/') || self.path == "*") {
            return Err(ParseError::invalid_pseudo_header(":path"));
        }

        let uri: Uri = match (&self.scheme, &self.authority) {
            (Some(scheme), Some(authority)) => format!("{scheme}://{authority}{}", self.path).parse::<Uri>(),
            _ => self.path.parse::<Uri>(),
        }
        .map_err(|_e| ParseError::InvalidUri)?;

        let mut request = Request::builder()
            .method(self.method)
            .uri(uri)
            .version(Version::HTTP_2)
            .body(())
            .map_err(|e| ParseError::invalid_header(e))?;
        *request.headers_mut() = self.headers;

        Ok(RequestHeader::from(request))
    }
}

/// An inbound stream event, already decoded by the framing layer.
#[derive(Debug)]
pub enum Http2Frame {
    /// A header block: it opens the stream when the id is new, and carries
    /// trailers when the stream is already open.
    Headers { stream_id: StreamId, headers: StreamHeaders, end_stream: bool },
    Data { stream_id: StreamId, data: Bytes, end_stream: bool },
    RstStream { stream_id: StreamId, reason: Reason },
    GoAway { last_stream_id: StreamId, reason: Reason },
}

impl Http2Frame {
    /// The stream this frame belongs to, `None` for connection-level frames.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Http2Frame::Headers { stream_id, .. }
            | Http2Frame::Data { stream_id, .. }
            | Http2Frame::RstStream { stream_id, .. } => Some(*stream_id),
            Http2Frame::GoAway { .. } => None,
        }
    }
}

/// An outbound instruction for the framing layer.
#[derive(Debug)]
pub enum Http2Command {
    /// Announce a server-initiated stream on the associated `stream_id`.
    PushPromise { stream_id: StreamId, promised_stream_id: StreamId, headers: StreamHeaders },
    Headers { stream_id: StreamId, head: ResponseHead, end_stream: bool },
    Data { stream_id: StreamId, data: Bytes, end_stream: bool },
    RstStream { stream_id: StreamId, reason: Reason },
    /// Received data was consumed: reopen the peer's send window by
    /// `increment` bytes. Stream id `0` is the connection window.
    WindowUpdate { stream_id: StreamId, increment: u32 },
}

impl Http2Command {
    /// The stream this command targets, `0` for the connection itself.
    pub fn stream_id(&self) -> StreamId {
        match self {
            Http2Command::PushPromise { stream_id, .. }
            | Http2Command::Headers { stream_id, .. }
            | Http2Command::Data { stream_id, .. }
            | Http2Command::RstStream { stream_id, .. }
            | Http2Command::WindowUpdate { stream_id, .. } => *stream_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_absolute_uri_from_pseudo_headers() {
        let header = StreamHeaders::new(Method::GET, "/style.css?v=2")
            .with_scheme("https")
            .with_authority("example.com:443")
            .into_request_header()
            .unwrap();

        assert_eq!(header.uri().path(), "/style.css");
        assert_eq!(header.uri().query(), Some("v=2"));
        assert_eq!(header.uri().authority().map(|a| a.as_str()), Some("example.com:443"));
        assert_eq!(header.version(), Version::HTTP_2);
    }

    #[test]
    fn rejects_missing_path() {
        let result = StreamHeaders::new(Method::GET, "").into_request_header();
        assert!(matches!(result, Err(ParseError::InvalidPseudoHeader { name: ":path" })));
    }

    #[test]
    fn reason_display() {
        assert_eq!(Reason::REFUSED_STREAM.to_string(), "REFUSED_STREAM");
        assert_eq!(Reason::from_code(0xff).to_string(), "unknown error code 0xff");
    }
}
