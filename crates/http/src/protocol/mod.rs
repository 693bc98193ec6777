//! Protocol types shared by the codec and the transport dispatcher.
//!
//! - [`Message`], [`PayloadItem`], [`PayloadSize`]: the HTTP/1.1 message stream
//!   produced by the decoder and consumed by the encoder
//! - [`RequestHeader`], [`ResponseHead`]: request and response heads
//! - [`Http2Frame`], [`Http2Command`], [`StreamHeaders`], [`Reason`]: the
//!   HTTP/2 stream events the dispatcher consumes and the commands it emits
//! - [`HttpError`], [`ParseError`], [`SendError`]: protocol errors

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;

mod response;
pub use response::ResponseHead;

mod h2;
pub use h2::DEFAULT_INITIAL_WINDOW_SIZE;
pub use h2::Http2Command;
pub use h2::Http2Frame;
pub use h2::Reason;
pub use h2::StreamHeaders;
pub use h2::StreamId;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;
