//! Labelled streams: several framed messages packed into one packet.
//!
//! Layout: `(0x01, framed message)*` followed by a single `0x00`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Read;

use crate::chunk::{frame_bytes, frame_reader};
use crate::framed::FramedBuffer;
use crate::WireError;

/// Flag byte announcing another framed message
pub const MESSAGE_FOLLOWS: u8 = 0x01;

/// Flag byte ending a labelled stream
pub const STREAM_END: u8 = 0x00;

/// Builder for one outgoing packet
#[derive(Debug)]
pub struct LabelledWriter {
    out: BytesMut,
    chunk_size: usize,
    count: usize,
}

impl LabelledWriter {
    /// Create a writer framing messages with `chunk_size` chunks
    pub fn new(chunk_size: usize) -> Self {
        Self {
            out: BytesMut::new(),
            chunk_size,
            count: 0,
        }
    }

    /// Append a message drained from a reader. A failing reader leaves the
    /// stream as it was before the call.
    pub fn push_reader<R: Read + ?Sized>(&mut self, content: &mut R) -> Result<usize, WireError> {
        let mark = self.out.len();
        self.out.put_u8(MESSAGE_FOLLOWS);
        match frame_reader(content, self.chunk_size, &mut self.out) {
            Ok(written) => {
                self.count += 1;
                Ok(written)
            }
            Err(err) => {
                self.out.truncate(mark);
                Err(err)
            }
        }
    }

    /// Append a contiguous message
    pub fn push_bytes(&mut self, content: &[u8]) {
        self.out.put_u8(MESSAGE_FOLLOWS);
        frame_bytes(content, self.chunk_size, &mut self.out);
        self.count += 1;
    }

    /// Bytes written so far, excluding the end flag
    pub fn len(&self) -> usize {
        self.out.len()
    }

    /// Whether no message was added
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of messages packed
    pub fn count(&self) -> usize {
        self.count
    }

    /// Terminate the stream
    pub fn finish(mut self) -> Bytes {
        self.out.put_u8(STREAM_END);
        self.out.freeze()
    }
}

/// Pack items produced by `next` until the packet exceeds `recommended`
/// bytes or `next` runs dry.
///
/// The item that pushes the packet past the recommended size is still
/// included; the following one is never requested. An item whose content
/// cannot be read leaves the packet untouched and is handed to `unreadable`.
/// Returns the packet and the packed items in packet order.
pub fn pack_labelled<T, F, R>(recommended: usize, chunk_size: usize, mut next: F, mut unreadable: R) -> (Bytes, Vec<T>)
where
    T: AsMut<FramedBuffer>,
    F: FnMut() -> Option<T>,
    R: FnMut(T, WireError),
{
    let mut writer = LabelledWriter::new(chunk_size);
    let mut packed = Vec::new();
    while writer.len() <= recommended {
        let Some(mut item) = next() else {
            break;
        };
        match writer.push_reader(item.as_mut()) {
            Ok(_) => packed.push(item),
            Err(err) => unreadable(item, err),
        }
    }
    (writer.finish(), packed)
}

/// Sequential reader over a received labelled stream
#[derive(Debug)]
pub struct LabelledReader {
    buf: Bytes,
    max_message_size: usize,
    finished: bool,
}

impl LabelledReader {
    /// Wrap a complete packet
    pub fn new(buf: Bytes, max_message_size: usize) -> Self {
        Self {
            buf,
            max_message_size,
            finished: false,
        }
    }

    /// Next framed message, `Ok(None)` after the end flag
    pub fn next_message(&mut self) -> Result<Option<FramedBuffer>, WireError> {
        if self.finished {
            return Ok(None);
        }
        if !self.buf.has_remaining() {
            return Err(WireError::Incomplete);
        }
        match self.buf.get_u8() {
            MESSAGE_FOLLOWS => crate::chunk::unframe(&mut self.buf, self.max_message_size).map(Some),
            STREAM_END => {
                self.finished = true;
                if self.buf.has_remaining() {
                    return Err(WireError::Malformed);
                }
                Ok(None)
            }
            other => Err(WireError::Flag(other)),
        }
    }
}

impl Iterator for LabelledReader {
    type Item = Result<FramedBuffer, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_message() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => None,
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Unpack every message of a packet
pub fn unpack_labelled(buf: Bytes, max_message_size: usize) -> Result<Vec<FramedBuffer>, WireError> {
    LabelledReader::new(buf, max_message_size).collect()
}
