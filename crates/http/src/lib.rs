//! Wire-level building blocks for the micro-host application host.
//!
//! This crate holds everything the transport dispatcher needs to talk to the
//! network without knowing anything about pipelines or calls:
//!
//! - [`protocol`]: request/response heads, payload messages, the HTTP/2 event
//!   model and the protocol error types
//! - [`codec`]: a streaming HTTP/1.1 request decoder and response encoder built
//!   on `tokio_util::codec`
//!
//! # Example
//!
//! ```no_run
//! use bytes::BytesMut;
//! use micro_host_http::codec::RequestDecoder;
//! use micro_host_http::protocol::Message;
//! use tokio_util::codec::Decoder;
//!
//! let mut decoder = RequestDecoder::new();
//! let mut buffer = BytesMut::from(&b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n"[..]);
//!
//! if let Ok(Some(Message::Header((header, _payload_size)))) = decoder.decode(&mut buffer) {
//!     assert_eq!(header.uri().path(), "/index.html");
//! }
//! ```
//!
//! # Limitations
//!
//! - HTTP/2 binary framing and HPACK are not implemented here, the HTTP/2
//!   side is modelled at the event level ([`protocol::Http2Frame`] in,
//!   [`protocol::Http2Command`] out)
//! - Maximum header size: 8KB
//! - Maximum number of headers: 64

pub mod codec;
pub mod protocol;

mod utils;
pub(crate) use utils::ensure;
