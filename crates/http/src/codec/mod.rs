//! Streaming HTTP/1.1 codec.
//!
//! - [`RequestDecoder`]: turns inbound bytes into a request head followed by
//!   payload chunks and an EOF marker
//! - [`ResponseEncoder`]: serializes a response head followed by payload
//!   chunks, framing them with `Content-Length` or chunked encoding
//!
//! Bytes past the end of the current request stay in the caller's read
//! buffer untouched; they are decoded only when the caller asks for the next
//! message. The HTTP/1.1 dispatcher relies on this to hold pipelined input
//! back while an exchange is still in flight.

mod payload;
mod request_decoder;
mod response_encoder;

pub use request_decoder::RequestDecoder;
pub use response_encoder::ResponseEncoder;
