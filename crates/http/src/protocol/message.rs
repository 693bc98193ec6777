use bytes::{Buf, Bytes};

/// One item of an HTTP/1.1 message stream: the head, or a piece of the payload.
///
/// The decoder yields `Message<(RequestHeader, PayloadSize)>` and the encoder
/// accepts `Message<(ResponseHead, PayloadSize), D>`.
#[derive(Debug)]
pub enum Message<T, Data: Buf = Bytes> {
    Header(T),
    Payload(PayloadItem<Data>),
}

/// A chunk of payload, or the end of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    Chunk(Data),
    Eof,
}

/// How the payload following a head is delimited on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// `Content-Length` delimited
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// no payload at all
    Empty,
}

impl PayloadSize {
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, PayloadSize::Chunked)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, PayloadSize::Empty)
    }

    /// Picks the wire delimiting for a body whose exact length may be known.
    pub fn from_exact(exact: Option<u64>) -> Self {
        match exact {
            Some(0) => PayloadSize::Empty,
            Some(length) => PayloadSize::Length(length),
            None => PayloadSize::Chunked,
        }
    }
}

impl<D: Buf> PayloadItem<D> {
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, PayloadItem::Eof)
    }
}
