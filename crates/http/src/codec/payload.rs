//! Payload framing: `Content-Length` and chunked transfer encoding (RFC 7230 §3.3, §4.1).

use std::cmp;
use std::io::Write;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::ensure;
use crate::protocol::{ParseError, PayloadItem, PayloadSize, SendError};

/// Longest chunk-size line (size plus extensions) we are willing to buffer.
const MAX_CHUNK_LINE: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PayloadDecoder {
    kind: DecodeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeKind {
    /// bytes still expected
    Length(u64),
    Chunked(ChunkState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataCrlf,
    Trailer,
    Done,
}

impl From<PayloadSize> for PayloadDecoder {
    fn from(payload_size: PayloadSize) -> Self {
        let kind = match payload_size {
            PayloadSize::Length(length) => DecodeKind::Length(length),
            PayloadSize::Chunked => DecodeKind::Chunked(ChunkState::Size),
            PayloadSize::Empty => DecodeKind::Length(0),
        };
        Self { kind }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            DecodeKind::Length(0) => Ok(Some(PayloadItem::Eof)),
            DecodeKind::Length(remaining) => {
                if src.is_empty() {
                    return Ok(None);
                }
                let len = cmp::min(*remaining, src.len() as u64);
                let bytes = src.split_to(usize::try_from(len).unwrap_or(usize::MAX)).freeze();
                *remaining -= bytes.len() as u64;
                Ok(Some(PayloadItem::Chunk(bytes)))
            }
            DecodeKind::Chunked(state) => decode_chunked(state, src),
        }
    }
}

fn decode_chunked(state: &mut ChunkState, src: &mut BytesMut) -> Result<Option<PayloadItem>, ParseError> {
    loop {
        match *state {
            ChunkState::Size => {
                let Some(line_end) = find_crlf(src) else {
                    ensure!(src.len() <= MAX_CHUNK_LINE, ParseError::invalid_chunk("chunk size line too long"));
                    return Ok(None);
                };
                let size = parse_chunk_size(&src[..line_end])?;
                src.advance(line_end + 2);
                trace!(size, "read chunk size");
                *state = if size == 0 { ChunkState::Trailer } else { ChunkState::Data(size) };
            }
            ChunkState::Data(remaining) => {
                if src.is_empty() {
                    return Ok(None);
                }
                let len = cmp::min(remaining, src.len() as u64);
                let bytes = src.split_to(usize::try_from(len).unwrap_or(usize::MAX)).freeze();
                let left = remaining - bytes.len() as u64;
                *state = if left == 0 { ChunkState::DataCrlf } else { ChunkState::Data(left) };
                return Ok(Some(PayloadItem::Chunk(bytes)));
            }
            ChunkState::DataCrlf => {
                if src.len() < 2 {
                    return Ok(None);
                }
                ensure!(&src[..2] == b"\r\n", ParseError::invalid_chunk("missing CRLF after chunk data"));
                src.advance(2);
                *state = ChunkState::Size;
            }
            ChunkState::Trailer => {
                // trailer fields are read and dropped, an empty line ends the body
                let Some(line_end) = find_crlf(src) else {
                    ensure!(src.len() <= MAX_CHUNK_LINE, ParseError::invalid_chunk("trailer line too long"));
                    return Ok(None);
                };
                src.advance(line_end + 2);
                if line_end == 0 {
                    *state = ChunkState::Done;
                }
            }
            ChunkState::Done => return Ok(Some(PayloadItem::Eof)),
        }
    }
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|window| window == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let size = line.split(|b| *b == b';').next().unwrap_or_default();
    let size = std::str::from_utf8(size).map_err(|_e| ParseError::invalid_chunk("chunk size is not ascii"))?;
    let size = size.trim_matches(|c| c == ' ' || c == '\t');
    ensure!(!size.is_empty(), ParseError::invalid_chunk("empty chunk size"));
    u64::from_str_radix(size, 16).map_err(|e| ParseError::invalid_chunk(format!("invalid chunk size `{size}`: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PayloadEncoder {
    kind: EncodeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncodeKind {
    Length { remaining: u64 },
    Chunked { eof: bool },
    Empty,
}

impl From<PayloadSize> for PayloadEncoder {
    fn from(payload_size: PayloadSize) -> Self {
        let kind = match payload_size {
            PayloadSize::Length(length) => EncodeKind::Length { remaining: length },
            PayloadSize::Chunked => EncodeKind::Chunked { eof: false },
            PayloadSize::Empty => EncodeKind::Empty,
        };
        Self { kind }
    }
}

impl PayloadEncoder {
    pub(crate) fn is_finish(&self) -> bool {
        match self.kind {
            EncodeKind::Length { remaining } => remaining == 0,
            EncodeKind::Chunked { eof } => eof,
            EncodeKind::Empty => true,
        }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match (&mut self.kind, item) {
            (EncodeKind::Length { remaining }, PayloadItem::Chunk(bytes)) => {
                let len = bytes.remaining() as u64;
                if len > *remaining {
                    warn!(len, remaining = *remaining, "response body exceeds its content-length");
                    return Err(SendError::invalid_body("response body exceeds its content-length"));
                }
                *remaining -= len;
                dst.put(bytes);
                Ok(())
            }
            (EncodeKind::Chunked { eof: false }, PayloadItem::Chunk(bytes)) => {
                if !bytes.has_remaining() {
                    return Ok(());
                }
                write!((&mut *dst).writer(), "{:X}\r\n", bytes.remaining())?;
                dst.put(bytes);
                dst.put_slice(b"\r\n");
                Ok(())
            }
            (EncodeKind::Chunked { eof }, PayloadItem::Eof) => {
                if !*eof {
                    *eof = true;
                    dst.put_slice(b"0\r\n\r\n");
                }
                Ok(())
            }
            (EncodeKind::Length { remaining }, PayloadItem::Eof) if *remaining > 0 => {
                Err(SendError::invalid_body(format!("response body ended {remaining} bytes short of its content-length")))
            }
            (EncodeKind::Empty, PayloadItem::Chunk(bytes)) if bytes.has_remaining() => {
                Err(SendError::invalid_body("response declared no body but produced data"))
            }
            _ => Ok(()),
        }
    }
}
