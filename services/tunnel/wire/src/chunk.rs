//! Chunk framing.
//!
//! A message is written as one or more chunks, each preceded by a 6-byte
//! header: magic byte, little-endian `i32` length, final-chunk flag. The
//! total length never has to be known up front, so readers of unknown size
//! can be framed while they are drained.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Read;

use crate::framed::{FramedBuffer, ReadMode};
use crate::primitives::need;
use crate::WireError;

/// Magic byte opening every chunk header
pub const CHUNK_MAGIC: u8 = 0xC7;

/// Encoded chunk header size
pub const CHUNK_HEADER_SIZE: usize = 6;

/// Default payload bytes per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default ceiling for a reassembled message (16 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Payload length of this chunk
    pub len: u32,
    /// Whether this chunk ends the message
    pub last: bool,
}

impl ChunkHeader {
    /// Encode header to buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(CHUNK_MAGIC);
        buf.put_i32_le(self.len as i32);
        buf.put_u8(self.last as u8);
    }

    /// Decode header from buffer
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, CHUNK_HEADER_SIZE)?;
        let header = Self::peek(&buf[..CHUNK_HEADER_SIZE])?;
        buf.advance(CHUNK_HEADER_SIZE);
        Ok(header)
    }

    fn peek(raw: &[u8]) -> Result<Self, WireError> {
        if raw[0] != CHUNK_MAGIC {
            return Err(WireError::BadMagic {
                expected: CHUNK_MAGIC,
                found: raw[0],
            });
        }
        let len = i32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]);
        if len < 0 {
            return Err(WireError::Size(len as i64));
        }
        let last = match raw[5] {
            0 => false,
            1 => true,
            other => return Err(WireError::Flag(other)),
        };
        Ok(Self {
            len: len as u32,
            last,
        })
    }
}

/// Frame everything `content` yields into `out`, returning the payload size.
///
/// An empty source still produces one final chunk of length zero.
pub fn frame_reader<R: Read + ?Sized>(
    content: &mut R,
    chunk_size: usize,
    out: &mut BytesMut,
) -> Result<usize, WireError> {
    let chunk_size = chunk_size.max(1);
    let mut total = 0;
    let mut pending = fill(content, chunk_size)?;
    loop {
        let next = if pending.len() < chunk_size {
            Vec::new()
        } else {
            fill(content, chunk_size)?
        };
        let last = next.is_empty();

        ChunkHeader {
            len: pending.len() as u32,
            last,
        }
        .encode(out);
        out.put_slice(&pending);
        total += pending.len();

        if last {
            return Ok(total);
        }
        pending = next;
    }
}

/// Frame a contiguous payload
pub fn frame_bytes(payload: &[u8], chunk_size: usize, out: &mut BytesMut) {
    let chunk_size = chunk_size.max(1);
    let mut chunks = payload.chunks(chunk_size).peekable();
    if chunks.peek().is_none() {
        ChunkHeader { len: 0, last: true }.encode(out);
        return;
    }
    while let Some(chunk) = chunks.next() {
        ChunkHeader {
            len: chunk.len() as u32,
            last: chunks.peek().is_none(),
        }
        .encode(out);
        out.put_slice(chunk);
    }
}

/// Encoded size of a payload of known length
pub fn framed_len(payload_len: usize, chunk_size: usize) -> usize {
    let chunk_size = chunk_size.max(1);
    let chunks = payload_len.div_ceil(chunk_size).max(1);
    chunks * CHUNK_HEADER_SIZE + payload_len
}

/// Read one framed message out of a complete buffer
pub fn unframe(buf: &mut Bytes, max_message_size: usize) -> Result<FramedBuffer, WireError> {
    let mut message = FramedBuffer::new(ReadMode::Replay);
    let mut total = 0usize;
    loop {
        let header = ChunkHeader::decode(buf)?;
        let len = header.len as usize;
        total += len;
        if total > max_message_size {
            return Err(WireError::Size(total as i64));
        }
        need(buf, len)?;
        message.push_bytes(buf.split_to(len));
        if header.last {
            return Ok(message);
        }
    }
}

fn fill<R: Read + ?Sized>(content: &mut R, chunk_size: usize) -> Result<Vec<u8>, WireError> {
    let mut chunk = vec![0u8; chunk_size];
    let mut filled = 0;
    while filled < chunk_size {
        let n = content.read(&mut chunk[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    chunk.truncate(filled);
    Ok(chunk)
}

/// Incremental decoder turning a byte stream into framed messages
///
/// Chunks are collected into a release-on-read [`FramedBuffer`] until the
/// final chunk arrives.
#[derive(Debug)]
pub struct ChunkDecoder {
    max_message_size: usize,
    partial: Option<FramedBuffer>,
    partial_len: usize,
}

impl ChunkDecoder {
    /// Create a decoder bounded by `max_message_size`
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            partial: None,
            partial_len: 0,
        }
    }

    /// Decode one chunk, `Ok(None)` while the buffer holds less than a chunk
    pub fn decode_chunk(&mut self, buf: &mut BytesMut) -> Result<Option<(ChunkHeader, Bytes)>, WireError> {
        if buf.len() < CHUNK_HEADER_SIZE {
            return Ok(None);
        }
        let header = ChunkHeader::peek(&buf[..CHUNK_HEADER_SIZE])?;
        let len = header.len as usize;
        if len > self.max_message_size {
            return Err(WireError::Size(len as i64));
        }
        if buf.len() < CHUNK_HEADER_SIZE + len {
            return Ok(None);
        }
        buf.advance(CHUNK_HEADER_SIZE);
        Ok(Some((header, buf.split_to(len).freeze())))
    }

    /// Decode one complete message, `Ok(None)` until its final chunk arrived
    pub fn decode_message(&mut self, buf: &mut BytesMut) -> Result<Option<FramedBuffer>, WireError> {
        while let Some((header, payload)) = self.decode_chunk(buf)? {
            self.partial_len += payload.len();
            if self.partial_len > self.max_message_size {
                return Err(WireError::Size(self.partial_len as i64));
            }
            self.partial
                .get_or_insert_with(|| FramedBuffer::new(ReadMode::ReleaseOnRead))
                .push_bytes(payload);
            if header.last {
                self.partial_len = 0;
                return Ok(Some(
                    self.partial
                        .take()
                        .unwrap_or_else(|| FramedBuffer::new(ReadMode::ReleaseOnRead)),
                ));
            }
        }
        Ok(None)
    }

    /// Whether a message is partially assembled
    pub fn is_mid_message(&self) -> bool {
        self.partial.is_some()
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}
