//! The request head shared by HTTP/1.1 exchanges and HTTP/2 streams.

use http::header::{CONNECTION, EXPECT};
use http::{HeaderMap, Method, Request, Uri, Version};

/// The head of an incoming request, before any body is attached.
///
/// Wraps a `http::Request<()>` so that both the HTTP/1.1 decoder and the
/// HTTP/2 stream headers converge on one type.
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl RequestHeader {
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Whether the client sent `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.headers()
            .get(EXPECT)
            .is_some_and(|value| value.as_bytes().len() >= 4 && value.as_bytes()[..4].eq_ignore_ascii_case(b"100-"))
    }

    /// Whether the connection may carry another exchange after this one.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is present,
    /// HTTP/1.0 only keeps the connection with an explicit `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        let connection = self.headers().get(CONNECTION).map(http::HeaderValue::as_bytes);
        match self.version() {
            Version::HTTP_10 => connection.is_some_and(|value| value.eq_ignore_ascii_case(b"keep-alive")),
            _ => !connection.is_some_and(|value| value.eq_ignore_ascii_case(b"close")),
        }
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}
