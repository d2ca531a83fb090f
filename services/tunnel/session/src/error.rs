//! Transport error types and their failure classes.

use std::io;
use std::sync::Arc;
use thiserror::Error;
use tunnel_wire::WireError;

/// Result alias used across the session layer
pub type Result<T> = std::result::Result<T, TransportError>;

/// How a failure propagates through the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Socket or HTTP problem; eligible for reconnection
    Recoverable,
    /// Protocol state can no longer be trusted; the connection is closed
    Desynchronization,
    /// Queue admission failed; the whole outbound queue is disposed
    Admission,
    /// A deadline passed; reported only to the affected waiter
    Deadline,
    /// Teardown without reconnection, peer resources are released
    Critical,
}

/// Transport errors
///
/// Cloneable so a single cause can be reported to every message of a
/// disposed queue.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Socket I/O failed
    #[error("transport I/O failed: {0}")]
    Io(Arc<io::Error>),

    /// HTTP request failed below the protocol level
    #[error("http transport failed: {0}")]
    Http(String),

    /// Connection establishment exceeded the connect timeout
    #[error("connecting to {0} timed out")]
    ConnectTimeout(String),

    /// The remote end closed the connection
    #[error("connection closed by remote: {0}")]
    ConnectionClosed(String),

    /// The remote refused the connection for capacity reasons
    #[error("connection refused by remote: {0}")]
    PoolFull(String),

    /// Malformed bytes on the wire
    #[error("protocol error: {0}")]
    Wire(#[from] WireError),

    /// Sequence numbers or packet types do not match the expected state
    #[error("protocol desynchronization: {0}")]
    Desynchronization(String),

    /// The outbound queue exceeded its item or byte ceiling
    #[error("outbound queue overloaded ({items} items, {bytes} bytes queued)")]
    QueueOverloaded {
        /// Items queued when admission failed
        items: usize,
        /// Bytes queued when admission failed
        bytes: usize,
    },

    /// A single message exceeds the per-message ceiling
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    SendTooLarge {
        /// Effective message size
        size: usize,
        /// Configured ceiling
        limit: usize,
    },

    /// A message deadline expired before it was sent
    #[error("send deadline exceeded")]
    SendTimeout,

    /// An invocation deadline expired before the reply arrived
    #[error("server did not reply before the deadline")]
    ServerDidNotReply,

    /// The connection was released locally or by the remote
    #[error("connection closed manually")]
    ClosedManually,

    /// The remote host restarted; its old connections are gone
    #[error("peer {0} restarted")]
    PeerRestarted(String),

    /// The remote failed to process a request
    #[error("remote reported a sender error")]
    SenderError,

    /// Reconnection gave up
    #[error("reconnection gave up after {tries} tries: {cause}")]
    ReconnectFailed {
        /// Attempts made
        tries: u32,
        /// The failure that started reconnection
        cause: Box<TransportError>,
    },

    /// The manager is shutting down
    #[error("transport is shut down")]
    Shutdown,

    /// The remote failed authentication
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// The security session failed to encrypt or decrypt
    #[error("security session failed: {0}")]
    Security(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// Failure class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Io(_)
            | TransportError::Http(_)
            | TransportError::ConnectTimeout(_)
            | TransportError::ConnectionClosed(_)
            | TransportError::PoolFull(_) => ErrorClass::Recoverable,
            TransportError::Wire(_) | TransportError::Desynchronization(_) => {
                ErrorClass::Desynchronization
            }
            TransportError::QueueOverloaded { .. } | TransportError::SendTooLarge { .. } => {
                ErrorClass::Admission
            }
            TransportError::SendTimeout | TransportError::ServerDidNotReply => ErrorClass::Deadline,
            TransportError::ClosedManually
            | TransportError::PeerRestarted(_)
            | TransportError::SenderError
            | TransportError::ReconnectFailed { .. }
            | TransportError::Shutdown
            | TransportError::Authentication(_)
            | TransportError::Security(_)
            | TransportError::Config(_) => ErrorClass::Critical,
        }
    }

    /// Whether the reconnection engine may handle this error
    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(Arc::new(err))
    }
}

impl From<hyper::Error> for TransportError {
    fn from(err: hyper::Error) -> Self {
        TransportError::Http(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for TransportError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        TransportError::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        let reset = TransportError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(reset.class(), ErrorClass::Recoverable);
        assert!(reset.is_recoverable());

        let magic = TransportError::from(WireError::BadMagic {
            expected: 0x4D,
            found: 0,
        });
        assert_eq!(magic.class(), ErrorClass::Desynchronization);

        let overflow = TransportError::QueueOverloaded { items: 3, bytes: 10 };
        assert_eq!(overflow.class(), ErrorClass::Admission);
        assert_eq!(TransportError::SendTimeout.class(), ErrorClass::Deadline);
        assert_eq!(TransportError::Shutdown.class(), ErrorClass::Critical);
    }

    #[test]
    fn test_clone_shares_io_error() {
        let err = TransportError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        let copy = err.clone();
        match (err, copy) {
            (TransportError::Io(a), TransportError::Io(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => panic!("expected io errors"),
        }
    }
}
