use std::io::{self, ErrorKind, Write};

use bytes::{Buf, BufMut, BytesMut};
use http::{header, HeaderValue, Version};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::codec::payload::PayloadEncoder;
use crate::protocol::{Message, PayloadSize, ResponseHead, SendError};

/// Initial buffer size reserved for the status line and headers
const INIT_HEADER_SIZE: usize = 4 * 1024;

/// Encodes a response head followed by its payload items.
///
/// The head's `Content-Length`/`Transfer-Encoding` headers are overwritten
/// to agree with the [`PayloadSize`] sent alongside it.
#[derive(Debug, Default)]
pub struct ResponseEncoder {
    payload_encoder: Option<PayloadEncoder>,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Default::default()
    }
}

impl<D: Buf> Encoder<Message<(ResponseHead, PayloadSize), D>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(ResponseHead, PayloadSize), D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("expect payload item but receive response head");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                }

                encode_head(head, payload_size, dst)?;
                let payload_encoder = PayloadEncoder::from(payload_size);
                if !payload_encoder.is_finish() {
                    self.payload_encoder = Some(payload_encoder);
                }
                Ok(())
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    // an empty body is complete with its head, a trailing EOF is fine
                    if payload_item.is_eof() {
                        return Ok(());
                    }
                    error!("expect response header but receive payload item");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                };

                let result = payload_encoder.encode(payload_item, dst);
                if result.is_err() || payload_encoder.is_finish() {
                    self.payload_encoder.take();
                }
                result
            }
        }
    }
}

fn encode_head(mut head: ResponseHead, payload_size: PayloadSize, dst: &mut BytesMut) -> Result<(), SendError> {
    dst.reserve(INIT_HEADER_SIZE);

    match head.version() {
        Version::HTTP_11 | Version::HTTP_10 => {
            let status = head.status();
            write!((&mut *dst).writer(), "HTTP/1.1 {} {}\r\n", status.as_str(), status.canonical_reason().unwrap_or("<unknown status code>"))?;
        }
        v => {
            error!(http_version = ?v, "unsupported http version");
            return Err(io::Error::from(ErrorKind::Unsupported).into());
        }
    }

    let headers = head.headers_mut();
    match payload_size {
        PayloadSize::Length(n) => {
            headers.remove(header::TRANSFER_ENCODING);
            headers.insert(header::CONTENT_LENGTH, n.into());
        }
        PayloadSize::Chunked => {
            headers.remove(header::CONTENT_LENGTH);
            headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
        PayloadSize::Empty => {
            headers.remove(header::TRANSFER_ENCODING);
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        }
    }

    for (name, value) in headers.iter() {
        dst.put_slice(name.as_ref());
        dst.put_slice(b": ");
        dst.put_slice(value.as_ref());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
    Ok(())
}
