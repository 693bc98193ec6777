//! Server push requests.
//!
//! A [`PushBuilder`] describes the resource to push. Unset parts of the
//! target are taken from the call that initiates the push, so a plain
//! `PushBuilder::new("/style.css")` pushes to the same origin.

use http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use micro_host_http::protocol::StreamHeaders;
use thiserror::Error;

use crate::call::{ApplicationCall, ApplicationRequest};

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push is disabled on this connection")]
    Disabled,

    #[error("invalid push target: {reason}")]
    InvalidTarget { reason: String },

    #[error("connection closed before the push could be started")]
    ConnectionClosed,
}

impl PushError {
    pub fn invalid_target<S: ToString>(str: S) -> Self {
        Self::InvalidTarget { reason: str.to_string() }
    }
}

/// Implemented by transports able to open server-initiated streams.
pub trait ResponsePusher: Send + Sync {
    fn push(&self, call: &ApplicationCall, builder: PushBuilder) -> Result<(), PushError>;
}

#[derive(Debug, Clone)]
pub struct PushBuilder {
    method: Method,
    scheme: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
}

impl PushBuilder {
    /// Pushes `GET path` to the origin of the initiating call. `path` may
    /// carry a query string.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (path, None),
        };
        Self { method: Method::GET, scheme: None, host: None, port: None, path, query, headers: HeaderMap::new() }
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Resolves the synthetic request headers of the pushed stream.
    ///
    /// The authority is always `host:port`; a port missing from both the
    /// builder and the origin defaults to the scheme's well-known port.
    pub fn into_stream_headers(self, origin: &ApplicationRequest) -> Result<StreamHeaders, PushError> {
        if !self.path.starts_with('/') {
            return Err(PushError::invalid_target(format!("path `{}` is not absolute", self.path)));
        }

        let scheme = self.scheme.unwrap_or_else(|| origin.scheme().to_owned());
        let (origin_host, origin_port) = split_authority(origin.authority().unwrap_or_default());
        let host = self.host.unwrap_or(origin_host);
        if host.is_empty() {
            return Err(PushError::invalid_target("no host to push to"));
        }
        let port = self.port.or(origin_port).unwrap_or(default_port(&scheme));

        let path = match self.query {
            Some(query) if !query.is_empty() => format!("{}?{query}", self.path),
            _ => self.path,
        };

        let mut headers = StreamHeaders::new(self.method, path).with_scheme(scheme).with_authority(format!("{host}:{port}"));
        headers.headers = self.headers;
        if let Some(user_agent) = origin.headers().get(header::USER_AGENT) {
            headers.headers.entry(header::USER_AGENT).or_insert_with(|| user_agent.clone());
        }
        Ok(headers)
    }
}

fn split_authority(authority: &str) -> (String, Option<u16>) {
    match authority.rfind(':') {
        // a colon inside `[..]` belongs to an IPv6 literal
        Some(i) if !authority[i..].contains(']') => match authority[i + 1..].parse::<u16>() {
            Ok(port) => (authority[..i].to_owned(), Some(port)),
            Err(_invalid) => (authority.to_owned(), None),
        },
        _ => (authority.to_owned(), None),
    }
}

fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 }
}
