use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version, header};
use http_body_util::BodyExt;
use micro_host_http::protocol::{ParseError, RequestHeader};
use mime::Mime;
use serde::de::DeserializeOwned;

use crate::call::RequestBody;

/// The read-only side of a call.
#[derive(Debug)]
pub struct ApplicationRequest {
    header: RequestHeader,
    body: Option<RequestBody>,
    scheme: &'static str,
    remote_addr: Option<SocketAddr>,
}

impl ApplicationRequest {
    pub fn new(header: RequestHeader, body: RequestBody) -> Self {
        Self { header, body: Some(body), scheme: "http", remote_addr: None }
    }

    #[must_use]
    pub fn with_scheme(mut self, scheme: &'static str) -> Self {
        self.scheme = scheme;
        self
    }

    #[must_use]
    pub fn with_remote_addr(mut self, remote_addr: Option<SocketAddr>) -> Self {
        self.remote_addr = remote_addr;
        self
    }

    pub fn header(&self) -> &RequestHeader {
        &self.header
    }

    pub fn method(&self) -> &Method {
        self.header.method()
    }

    pub fn uri(&self) -> &Uri {
        self.header.uri()
    }

    pub fn path(&self) -> &str {
        self.header.uri().path()
    }

    pub fn version(&self) -> Version {
        self.header.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.header.headers()
    }

    /// The scheme the request arrived with: from the URI when absolute,
    /// otherwise the transport's.
    pub fn scheme(&self) -> &str {
        self.header.uri().scheme_str().unwrap_or(self.scheme)
    }

    /// `:authority` for HTTP/2, the `Host` header for HTTP/1.1.
    pub fn authority(&self) -> Option<&str> {
        self.header
            .uri()
            .authority()
            .map(http::uri::Authority::as_str)
            .or_else(|| self.headers().get(header::HOST).and_then(|value| value.to_str().ok()))
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn query_string(&self) -> Option<&str> {
        self.header.uri().query()
    }

    /// Deserializes the query string, an absent one deserializes like an empty one.
    pub fn query<T: DeserializeOwned>(&self) -> Result<T, serde_urlencoded::de::Error> {
        serde_urlencoded::from_str(self.query_string().unwrap_or_default())
    }

    pub fn query_parameters(&self) -> Result<Vec<(String, String)>, serde_urlencoded::de::Error> {
        self.query()
    }

    /// Cookies sent in every `Cookie` header, in order. Values are returned
    /// as sent, without decoding.
    pub fn cookies(&self) -> Vec<(&str, &str)> {
        self.headers()
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .map(|(name, value)| (name.trim(), value.trim()))
            .collect()
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies().into_iter().find(|(n, _)| *n == name).map(|(_, value)| value)
    }

    /// The parsed `Content-Type`, `None` when missing or malformed.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers().get(header::CONTENT_TYPE)?.to_str().ok()?.parse().ok()
    }

    /// Takes the body out of the request; `None` once it has been taken.
    pub fn take_body(&mut self) -> Option<RequestBody> {
        self.body.take()
    }

    /// Reads the whole body into memory.
    pub async fn receive_bytes(&mut self) -> Result<Bytes, ParseError> {
        let body = self.take_body().ok_or_else(|| ParseError::invalid_body("request body has already been consumed"))?;
        Ok(body.collect().await?.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::request_with;
    use serde::Deserialize;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Paging {
        page: u32,
        size: Option<u32>,
    }

    #[test]
    fn query_parameters() {
        let request = request_with(|builder| builder.uri("/items?page=2&tag=a&tag=b"));

        assert_eq!(request.query::<Paging>().unwrap(), Paging { page: 2, size: None });
        assert_eq!(
            request.query_parameters().unwrap(),
            [("page", "2"), ("tag", "a"), ("tag", "b")].map(|(k, v)| (k.to_owned(), v.to_owned()))
        );
    }

    #[test]
    fn cookies_across_headers() {
        let request = request_with(|builder| {
            builder.uri("/").header(header::COOKIE, "session=abc; theme=dark").header(header::COOKIE, "lang=en")
        });

        assert_eq!(request.cookies(), [("session", "abc"), ("theme", "dark"), ("lang", "en")]);
        assert_eq!(request.cookie("theme"), Some("dark"));
        assert_eq!(request.cookie("missing"), None);
    }

    #[tokio::test]
    async fn body_can_be_received_once() {
        let (tx, body) = RequestBody::channel(2);
        tx.send(Ok(Bytes::from_static(b"payload"))).await.unwrap();
        drop(tx);

        let header = RequestHeader::from(http::Request::builder().uri("/").body(()).unwrap());
        let mut request = ApplicationRequest::new(header, body);

        assert_eq!(request.receive_bytes().await.unwrap(), Bytes::from_static(b"payload"));
        assert!(matches!(request.receive_bytes().await, Err(ParseError::InvalidBody { .. })));
    }

    #[test]
    fn content_type_is_parsed() {
        let request = request_with(|builder| builder.uri("/").header(header::CONTENT_TYPE, "application/json; charset=utf-8"));
        let content_type = request.content_type().unwrap();
        assert_eq!(content_type.essence_str(), "application/json");
        assert_eq!(content_type.get_param(mime::CHARSET), Some(mime::UTF_8));

        let garbage = request_with(|builder| builder.uri("/").header(header::CONTENT_TYPE, "not a mime"));
        assert_eq!(garbage.content_type(), None);
    }
}
