//! Streaming decoder for HTTP/1.1 requests.
//!
//! The decoder is a two-state machine driven by `payload_decoder`:
//!
//! - `None`: waiting for a request head, parsed with `httparse`
//! - `Some(PayloadDecoder)`: forwarding body chunks until the payload's EOF
//!
//! Once the EOF item is emitted the decoder is back to `None` and the next
//! call parses whatever pipelined request follows in the buffer.

use bytes::{Buf, BytesMut};
use http::{header, HeaderName, HeaderValue, Request, Version};
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::payload::PayloadDecoder;
use crate::ensure;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHeader};

/// Maximum number of headers allowed in a request
const MAX_HEADER_NUM: usize = 64;

/// Maximum size in bytes allowed for the request line plus header section
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Shortest input that could hold a full request head: `GET / HTTP/1.1\r\n\r\n` minus slack.
const MIN_HEAD_LEN: usize = 14;

#[derive(Debug, Default)]
pub struct RequestDecoder {
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Whether the decoder is in the middle of a request body.
    pub fn in_payload(&self) -> bool {
        self.payload_decoder.is_some()
    }
}

impl Decoder for RequestDecoder {
    type Item = Message<(RequestHeader, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let message = match payload_decoder.decode(src)? {
                Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
                Some(item @ PayloadItem::Eof) => {
                    self.payload_decoder.take();
                    Some(Message::Payload(item))
                }
                None => None,
            };
            return Ok(message);
        }

        let Some((header, payload_size)) = decode_head(src)? else {
            return Ok(None);
        };
        trace!(method = %header.method(), uri = %header.uri(), ?payload_size, "decoded request head");

        self.payload_decoder = Some(PayloadDecoder::from(payload_size));
        Ok(Some(Message::Header((header, payload_size))))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() && self.payload_decoder.is_none() => Ok(None),
            None => Err(ParseError::UnexpectedEof),
        }
    }
}

fn decode_head(src: &mut BytesMut) -> Result<Option<(RequestHeader, PayloadSize)>, ParseError> {
    if src.len() < MIN_HEAD_LEN {
        return Ok(None);
    }

    let (request, offset) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut req = httparse::Request::new(&mut headers);

        let status = req.parse(src).map_err(|e| match e {
            httparse::Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            httparse::Error::Version => ParseError::InvalidVersion(None),
            e => ParseError::invalid_header(e),
        })?;

        let offset = match status {
            Status::Complete(offset) => offset,
            Status::Partial => {
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                return Ok(None);
            }
        };
        ensure!(offset <= MAX_HEADER_BYTES, ParseError::too_large_header(offset, MAX_HEADER_BYTES));

        let version = match req.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            v => return Err(ParseError::InvalidVersion(v)),
        };

        let mut request = Request::builder()
            .method(req.method.ok_or(ParseError::InvalidMethod)?)
            .uri(req.path.ok_or(ParseError::InvalidUri)?)
            .version(version)
            .body(())
            .map_err(|_e| ParseError::InvalidUri)?;

        let header_map = request.headers_mut();
        header_map.reserve(req.headers.len());
        for h in req.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(ParseError::invalid_header)?;
            let value = HeaderValue::from_bytes(h.value).map_err(ParseError::invalid_header)?;
            header_map.append(name, value);
        }

        (request, offset)
    };
    src.advance(offset);

    let header = RequestHeader::from(request);
    let payload_size = parse_payload_size(&header)?;
    Ok(Some((header, payload_size)))
}

/// Chooses the body framing per RFC 9112 §6.3: chunked transfer coding wins
/// over `Content-Length`, and a request with neither has no body.
fn parse_payload_size(header: &RequestHeader) -> Result<PayloadSize, ParseError> {
    let te_header = header.headers().get(header::TRANSFER_ENCODING);
    let cl_header = header.headers().get(header::CONTENT_LENGTH);

    if is_chunked(te_header) {
        return Ok(PayloadSize::Chunked);
    }

    match cl_header {
        None => Ok(PayloadSize::Empty),
        Some(cl_value) => {
            let cl_str = cl_value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;
            let length =
                cl_str.trim().parse::<u64>().map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not u64")))?;
            Ok(PayloadSize::from_exact(Some(length)))
        }
    }
}

/// Chunked must be the final coding when present.
fn is_chunked(header_value: Option<&HeaderValue>) -> bool {
    header_value
        .and_then(|value| value.as_bytes().rsplit(|b| *b == b',').next())
        .is_some_and(|last| last.trim_ascii().eq_ignore_ascii_case(b"chunked"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use indoc::indoc;

    fn collect_body(decoder: &mut RequestDecoder, buf: &mut BytesMut) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            match decoder.decode(buf).unwrap() {
                Some(Message::Payload(PayloadItem::Chunk(bytes))) => body.extend_from_slice(&bytes),
                Some(Message::Payload(PayloadItem::Eof)) => return body,
                other => panic!("unexpected decode result: {other:?}"),
            }
        }
    }

    #[test]
    fn from_curl() {
        let str = indoc! {r##"
        GET /index.html?lang=en HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1
        Accept: */*

        "##};
        let mut buf = BytesMut::from(str.replace('\n', "\r\n").as_str());
        let mut decoder = RequestDecoder::new();

        let Some(Message::Header((header, payload_size))) = decoder.decode(&mut buf).unwrap() else {
            panic!("expected a request head");
        };

        assert!(payload_size.is_empty());
        assert_eq!(header.method(), &Method::GET);
        assert_eq!(header.version(), Version::HTTP_11);
        assert_eq!(header.uri().path(), "/index.html");
        assert_eq!(header.uri().query(), Some("lang=en"));
        assert_eq!(header.headers().len(), 3);
        assert_eq!(header.headers().get(header::HOST).unwrap(), "127.0.0.1:8080");

        assert!(matches!(decoder.decode(&mut buf).unwrap(), Some(Message::Payload(PayloadItem::Eof))));
        assert!(buf.is_empty());
    }

    #[test]
    fn content_length_body() {
        let str = indoc! {r##"
        POST /submit HTTP/1.1
        Host: localhost
        Content-Length: 11

        hello world"##};
        let mut buf = BytesMut::from(str.replace('\n', "\r\n").as_str());
        let mut decoder = RequestDecoder::new();

        let Some(Message::Header((_, payload_size))) = decoder.decode(&mut buf).unwrap() else {
            panic!("expected a request head");
        };
        assert_eq!(payload_size, PayloadSize::Length(11));
        assert_eq!(collect_body(&mut decoder, &mut buf), b"hello world");
        assert!(!decoder.in_payload());
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let mut buf = BytesMut::from(
            &b"POST /upload HTTP/1.1\r\nContent-Length: 100\r\nTransfer-Encoding: gzip, chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n"[..],
        );
        let mut decoder = RequestDecoder::new();

        let Some(Message::Header((_, payload_size))) = decoder.decode(&mut buf).unwrap() else {
            panic!("expected a request head");
        };
        assert!(payload_size.is_chunked());
        assert_eq!(collect_body(&mut decoder, &mut buf), b"abc");
    }

    #[test]
    fn pipelined_request_stays_in_buffer() {
        let mut buf = BytesMut::from(
            &b"POST /a HTTP/1.1\r\nContent-Length: 2\r\n\r\nokGET /b HTTP/1.1\r\nHost: localhost\r\n\r\n"[..],
        );
        let mut decoder = RequestDecoder::new();

        assert!(matches!(decoder.decode(&mut buf).unwrap(), Some(Message::Header(_))));
        assert_eq!(collect_body(&mut decoder, &mut buf), b"ok");
        assert_eq!(&buf[..], b"GET /b HTTP/1.1\r\nHost: localhost\r\n\r\n");

        let Some(Message::Header((header, _))) = decoder.decode(&mut buf).unwrap() else {
            panic!("expected the pipelined request head");
        };
        assert_eq!(header.uri().path(), "/b");
    }

    #[test]
    fn partial_head_waits_for_more_input() {
        let mut buf = BytesMut::from(&b"GET /index.html HTTP/1.1\r\nHost: loc"[..]);
        let mut decoder = RequestDecoder::new();

        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"alhost\r\n\r\n");
        assert!(matches!(decoder.decode(&mut buf).unwrap(), Some(Message::Header(_))));
    }

    #[test]
    fn too_large_header() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nX-Filler: "[..]);
        buf.extend_from_slice(&vec![b'a'; MAX_HEADER_BYTES]);
        let mut decoder = RequestDecoder::new();

        assert!(matches!(decoder.decode(&mut buf), Err(ParseError::TooLargeHeader { .. })));
    }

    #[test]
    fn invalid_content_length() {
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n"[..]);
        let mut decoder = RequestDecoder::new();

        assert!(matches!(decoder.decode(&mut buf), Err(ParseError::InvalidContentLength { .. })));
    }

    #[test]
    fn eof_inside_body_is_an_error() {
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc"[..]);
        let mut decoder = RequestDecoder::new();

        assert!(matches!(decoder.decode(&mut buf).unwrap(), Some(Message::Header(_))));
        assert!(matches!(decoder.decode(&mut buf).unwrap(), Some(Message::Payload(PayloadItem::Chunk(_)))));
        assert!(matches!(decoder.decode_eof(&mut buf), Err(ParseError::UnexpectedEof)));
    }
}
