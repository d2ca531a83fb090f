//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
///
/// Every variant except [`WireError::Incomplete`] means the byte stream can no
/// longer be trusted; the session layer treats them as desynchronization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete input (need more data)
    #[error("incomplete input")]
    Incomplete,

    /// Magic byte mismatch, usually foreign or corrupted traffic
    #[error("bad magic byte {found:#04x}, expected {expected:#04x}")]
    BadMagic {
        /// Expected magic value
        expected: u8,
        /// Byte found on the wire
        found: u8,
    },

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Size limit exceeded or negative length
    #[error("size limit exceeded: {0}")]
    Size(i64),

    /// Unknown packet type
    #[error("unknown packet type {0}")]
    PacketType(u8),

    /// Unknown connection kind
    #[error("unknown connection kind {0}")]
    Kind(u8),

    /// Flag byte outside its domain
    #[error("invalid flag byte {0:#04x}")]
    Flag(u8),

    /// String field is not valid UTF-8 or has a malformed length prefix
    #[error("malformed string field")]
    String,

    /// Sequence number out of order
    #[error("sequence mismatch: expected {expected}, got {got}")]
    Sequence {
        /// Sequence number the reader expected
        expected: i32,
        /// Sequence number found on the wire
        got: i32,
    },

    /// A non-replayable segment was already consumed
    #[error("buffer is not replayable")]
    NotReplayable,

    /// Reading an embedded stream failed
    #[error("embedded stream failed: {0}")]
    Stream(String),

    /// Malformed structure
    #[error("malformed input")]
    Malformed,
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        WireError::Stream(err.to_string())
    }
}
