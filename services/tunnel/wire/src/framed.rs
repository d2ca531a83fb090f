//! Chunked byte accumulator backed by pooled buffers.
//!
//! A [`FramedBuffer`] is an ordered list of segments: leased pool buffers with
//! a valid length, shared [`Bytes`] slices, or embedded readers. Content is
//! appended without copying existing data and read back sequentially, either
//! repeatably ([`ReadMode::Replay`]) or strictly forward with every segment
//! released the moment it is consumed ([`ReadMode::ReleaseOnRead`]).

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::WireError;

/// Default size of a pooled buffer
pub const DEFAULT_POOL_BUFFER_SIZE: usize = 16 * 1024;

/// Fixed-size buffer lease service
#[derive(Debug)]
pub struct BufferPool {
    buf_size: usize,
    max_pooled: usize,
    buffers: Mutex<Vec<BytesMut>>,
    leased: AtomicUsize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buf_size` bytes, keeping at most
    /// `max_pooled` idle buffers around
    pub fn new(buf_size: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            buf_size,
            max_pooled,
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            leased: AtomicUsize::new(0),
        })
    }

    /// Size of every buffer handed out by this pool
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Number of buffers currently leased
    pub fn leased(&self) -> usize {
        self.leased.load(Ordering::Acquire)
    }

    /// Number of idle buffers kept for reuse
    pub fn pooled(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Lease a cleared buffer
    pub fn lease(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buf_size));
        self.leased.fetch_add(1, Ordering::AcqRel);
        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn give_back(&self, mut buf: BytesMut) {
        self.leased.fetch_sub(1, Ordering::AcqRel);
        if buf.capacity() < self.buf_size {
            return;
        }
        buf.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        } else {
            trace!("buffer pool is full: discarding returned buffer");
        }
    }
}

/// A buffer leased from a [`BufferPool`]; returned to the pool on drop
pub struct PooledBuf {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// Written bytes
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }

    /// Number of written bytes
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether nothing was written yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes that can still be written without exceeding the pool buffer size
    pub fn spare(&self) -> usize {
        self.pool.buf_size.saturating_sub(self.len())
    }

    /// Append as much of `data` as fits, returning the number of bytes taken
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.spare());
        if let Some(buf) = self.buf.as_mut() {
            buf.extend_from_slice(&data[..take]);
        }
        take
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.len()).finish()
    }
}

/// How a [`FramedBuffer`] is read back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Segments are retained; the buffer can be rewound and read again
    Replay,
    /// Each segment is released as soon as it is fully consumed
    ReleaseOnRead,
}

enum Segment {
    Pooled { buf: PooledBuf, len: usize },
    Bytes(Bytes),
    Stream(Box<dyn Read + Send>),
}

impl Segment {
    fn len(&self) -> Option<usize> {
        match self {
            Segment::Pooled { len, .. } => Some(*len),
            Segment::Bytes(bytes) => Some(bytes.len()),
            Segment::Stream(_) => None,
        }
    }

    fn slice(&self) -> Option<&[u8]> {
        match self {
            Segment::Pooled { buf, len } => Some(&buf.as_slice()[..*len]),
            Segment::Bytes(bytes) => Some(bytes),
            Segment::Stream(_) => None,
        }
    }
}

/// Ordered sequence of byte segments read back as one stream
pub struct FramedBuffer {
    segments: VecDeque<Segment>,
    mode: ReadMode,
    pool: Option<Arc<BufferPool>>,
    cursor: usize,
    offset: usize,
    stream_touched: bool,
}

impl FramedBuffer {
    /// Create an empty buffer
    pub fn new(mode: ReadMode) -> Self {
        Self {
            segments: VecDeque::new(),
            mode,
            pool: None,
            cursor: 0,
            offset: 0,
            stream_touched: false,
        }
    }

    /// Create an empty buffer whose writes are assembled in leased pool buffers
    pub fn with_pool(pool: Arc<BufferPool>, mode: ReadMode) -> Self {
        let mut buffer = Self::new(mode);
        buffer.pool = Some(pool);
        buffer
    }

    /// Wrap existing bytes in a replayable buffer
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let mut buffer = Self::new(ReadMode::Replay);
        buffer.push_bytes(bytes.into());
        buffer
    }

    /// Wrap a reader of unknown length
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        let mut buffer = Self::new(ReadMode::Replay);
        buffer.push_reader(reader);
        buffer
    }

    /// Read mode of this buffer
    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// Append a shared slice
    pub fn push_bytes(&mut self, bytes: Bytes) {
        if !bytes.is_empty() {
            self.segments.push_back(Segment::Bytes(bytes));
        }
    }

    /// Append a leased pool buffer of which the first `len` bytes are valid
    pub fn push_pooled(&mut self, buf: PooledBuf, len: usize) {
        let len = len.min(buf.len());
        if len > 0 {
            self.segments.push_back(Segment::Pooled { buf, len });
        }
    }

    /// Append an embedded reader; the total length becomes unknown
    pub fn push_reader(&mut self, reader: impl Read + Send + 'static) {
        self.segments.push_back(Segment::Stream(Box::new(reader)));
    }

    /// Append the unread content of another buffer without copying
    pub fn push_buffer(&mut self, mut other: FramedBuffer) {
        let skip = match other.mode {
            ReadMode::Replay => other.cursor,
            ReadMode::ReleaseOnRead => 0,
        };
        let mut offset = other.offset;
        for segment in other.segments.drain(..).skip(skip) {
            match segment {
                Segment::Bytes(bytes) => self.push_bytes(bytes.slice(offset..)),
                Segment::Pooled { buf, len } if offset == 0 => self.push_pooled(buf, len),
                Segment::Pooled { buf, len } => {
                    self.push_bytes(Bytes::copy_from_slice(&buf.as_slice()[offset..len]))
                }
                Segment::Stream(reader) => self.segments.push_back(Segment::Stream(reader)),
            }
            offset = 0;
        }
    }

    /// Whether the total length is known
    pub fn is_seekable(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| !matches!(segment, Segment::Stream(_)))
    }

    /// Total logical length of the retained content, `None` while any embedded
    /// reader is present
    pub fn len(&self) -> Option<usize> {
        self.segments
            .iter()
            .try_fold(0usize, |acc, segment| segment.len().map(|len| acc + len))
    }

    /// Unread bytes, `None` while any embedded reader is present
    pub fn remaining(&self) -> Option<usize> {
        let skip = match self.mode {
            ReadMode::Replay => self.cursor,
            ReadMode::ReleaseOnRead => 0,
        };
        self.segments
            .iter()
            .skip(skip)
            .try_fold(0usize, |acc, segment| segment.len().map(|len| acc + len))
            .map(|total| total.saturating_sub(self.offset))
    }

    /// Best-effort size: exact when seekable, otherwise the bytes already
    /// buffered in memory
    pub fn size_hint(&self) -> usize {
        self.segments.iter().filter_map(Segment::len).sum()
    }

    /// Whether there is no content at all
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of retained segments
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Restart reading from the first byte
    pub fn rewind(&mut self) -> Result<(), WireError> {
        if self.mode == ReadMode::ReleaseOnRead && (self.cursor > 0 || self.offset > 0) {
            return Err(WireError::NotReplayable);
        }
        if self.stream_touched {
            return Err(WireError::NotReplayable);
        }
        self.cursor = 0;
        self.offset = 0;
        Ok(())
    }

    /// Whether [`FramedBuffer::rewind`] would succeed
    pub fn is_replayable(&self) -> bool {
        self.mode == ReadMode::Replay && !self.stream_touched
    }

    /// Read everything from the current position into one contiguous slice
    pub fn to_bytes(&mut self) -> Result<Bytes, WireError> {
        if self.mode == ReadMode::Replay && self.offset == 0 && self.cursor + 1 == self.segments.len() {
            if let Some(Segment::Bytes(bytes)) = self.segments.get(self.cursor) {
                let bytes = bytes.clone();
                self.cursor += 1;
                return Ok(bytes);
            }
        }
        if self.cursor == self.segments.len() && self.mode == ReadMode::Replay {
            return Ok(Bytes::new());
        }

        let mut out = Vec::with_capacity(self.remaining().unwrap_or_default());
        self.read_to_end(&mut out)?;
        Ok(Bytes::from(out))
    }

    fn current(&mut self) -> Option<&mut Segment> {
        match self.mode {
            ReadMode::Replay => self.segments.get_mut(self.cursor),
            ReadMode::ReleaseOnRead => self.segments.front_mut(),
        }
    }

    fn advance_segment(&mut self) {
        match self.mode {
            ReadMode::Replay => self.cursor += 1,
            ReadMode::ReleaseOnRead => {
                // dropping the segment returns pool buffers and closes readers
                self.segments.pop_front();
            }
        }
        self.offset = 0;
    }
}

impl Default for FramedBuffer {
    fn default() -> Self {
        Self::new(ReadMode::Replay)
    }
}

impl AsMut<FramedBuffer> for FramedBuffer {
    fn as_mut(&mut self) -> &mut FramedBuffer {
        self
    }
}

impl Read for FramedBuffer {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        loop {
            let offset = self.offset;
            let Some(segment) = self.current() else {
                return Ok(0);
            };

            if let Segment::Stream(reader) = segment {
                let n = reader.read(out)?;
                self.stream_touched = true;
                if n == 0 {
                    self.advance_segment();
                    continue;
                }
                return Ok(n);
            }

            let Some(slice) = segment.slice() else {
                return Ok(0);
            };
            let available = &slice[offset.min(slice.len())..];
            if available.is_empty() {
                self.advance_segment();
                continue;
            }

            let n = available.len().min(out.len());
            out[..n].copy_from_slice(&available[..n]);
            let exhausted = n == available.len();
            self.offset += n;
            if exhausted {
                self.advance_segment();
            }
            return Ok(n);
        }
    }
}

impl Write for FramedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let Some(pool) = self.pool.clone() else {
            self.push_bytes(Bytes::copy_from_slice(data));
            return Ok(data.len());
        };

        let mut written = 0;
        while written < data.len() {
            let tail_has_room = matches!(
                self.segments.back(),
                Some(Segment::Pooled { buf, len }) if *len == buf.len() && buf.spare() > 0
            );
            if !tail_has_room {
                let buf = pool.lease();
                self.segments.push_back(Segment::Pooled { buf, len: 0 });
            }
            if let Some(Segment::Pooled { buf, len }) = self.segments.back_mut() {
                let taken = buf.fill(&data[written..]);
                *len += taken;
                written += taken;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for FramedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedBuffer")
            .field("mode", &self.mode)
            .field("segments", &self.segments.len())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_pooled_writes_span_buffers() {
        let pool = BufferPool::new(4, 8);
        let mut buffer = FramedBuffer::with_pool(pool.clone(), ReadMode::Replay);
        buffer.write_all(b"hello world").unwrap();

        assert_eq!(buffer.segment_count(), 3);
        assert_eq!(buffer.len(), Some(11));
        assert_eq!(pool.leased(), 3);
        assert_eq!(buffer.to_bytes().unwrap(), Bytes::from_static(b"hello world"));

        drop(buffer);
        assert_eq!(pool.leased(), 0);
        assert_eq!(pool.pooled(), 3);
    }

    #[test]
    fn test_replay_mode_rewinds() {
        let mut buffer = FramedBuffer::new(ReadMode::Replay);
        buffer.push_bytes(Bytes::from_static(b"abc"));
        buffer.push_bytes(Bytes::from_static(b"def"));

        let mut first = String::new();
        buffer.read_to_string(&mut first).unwrap();
        buffer.rewind().unwrap();
        let mut second = String::new();
        buffer.read_to_string(&mut second).unwrap();

        assert_eq!(first, "abcdef");
        assert_eq!(second, "abcdef");
        assert_eq!(buffer.segment_count(), 2);
    }

    #[test]
    fn test_release_on_read_returns_buffers_early() {
        let pool = BufferPool::new(4, 8);
        let mut buffer = FramedBuffer::with_pool(pool.clone(), ReadMode::ReleaseOnRead);
        buffer.write_all(b"12345678").unwrap();
        assert_eq!(pool.leased(), 2);

        let mut head = [0u8; 4];
        buffer.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"1234");
        assert_eq!(pool.leased(), 1);
        assert_eq!(buffer.remaining(), Some(4));
        assert_eq!(buffer.rewind(), Err(WireError::NotReplayable));
    }

    #[test]
    fn test_stream_segment_makes_length_unknown() {
        let mut buffer = FramedBuffer::from_bytes(Bytes::from_static(b"head-"));
        buffer.push_reader(Cursor::new(b"tail".to_vec()));

        assert!(!buffer.is_seekable());
        assert_eq!(buffer.len(), None);
        assert_eq!(buffer.size_hint(), 5);
        assert_eq!(buffer.to_bytes().unwrap(), Bytes::from_static(b"head-tail"));
        assert_eq!(buffer.rewind(), Err(WireError::NotReplayable));
    }

    #[test]
    fn test_push_buffer_keeps_unread_part() {
        let mut inner = FramedBuffer::from_bytes(Bytes::from_static(b"skipkeep"));
        let mut skip = [0u8; 4];
        inner.read_exact(&mut skip).unwrap();

        let mut outer = FramedBuffer::from_bytes(Bytes::from_static(b">"));
        outer.push_buffer(inner);
        assert_eq!(outer.to_bytes().unwrap(), Bytes::from_static(b">keep"));
    }

    #[test]
    fn test_single_slice_is_not_copied() {
        let source = Bytes::from_static(b"zero-copy");
        let mut buffer = FramedBuffer::from_bytes(source.clone());
        let out = buffer.to_bytes().unwrap();
        assert_eq!(out.as_ptr(), source.as_ptr());
    }
}
