//! Outbound messages and connection addressing.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use tunnel_wire::{ConnectionKind, FramedBuffer};

use crate::error::TransportError;
use crate::handler::DispatchHandler;

/// Name of the default Persistent connection to a peer
pub const DEFAULT_CONNECTION_NAME: &str = "default";

/// Pool key: one logical connection to a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Peer URI
    pub peer: String,
    /// Logical connection name
    pub name: String,
    /// Connection kind
    pub kind: ConnectionKind,
}

impl ConnectionKey {
    /// Key of a connection
    pub fn new(peer: impl Into<String>, name: impl Into<String>, kind: ConnectionKind) -> Self {
        Self {
            peer: peer.into(),
            name: name.into(),
            kind,
        }
    }

    /// The default Persistent connection to `peer`
    pub fn persistent(peer: impl Into<String>) -> Self {
        Self::new(peer, DEFAULT_CONNECTION_NAME, ConnectionKind::Persistent)
    }

    /// A Named connection to `peer`
    pub fn named(peer: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(peer, name, ConnectionKind::Named)
    }

    /// A single-exchange connection to `peer`; the name is assigned on send
    pub fn invocation(peer: impl Into<String>) -> Self {
        Self::new(peer, String::new(), ConnectionKind::Invocation)
    }

    /// A one-way connection to `peer`; the name is assigned on send
    pub fn one_way(peer: impl Into<String>) -> Self {
        Self::new(peer, String::new(), ConnectionKind::OneWay)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}({})", self.peer, self.name, self.kind)
    }
}

/// Result delivered to a synchronous sender: the reply for invocations,
/// `None` once a message has been written to the transport
pub type Delivery = Result<Option<FramedBuffer>, TransportError>;

/// Atomically incremented identifiers owned by one manager
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator starting at 1
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Next identifier
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// A unit of transport
pub struct Message {
    id: u64,
    key: ConnectionKey,
    content: FramedBuffer,
    synchronous: bool,
    one_way: bool,
    deadline: Option<Instant>,
    effective_size: usize,
    resend_on_failure: bool,
    completion: Option<oneshot::Sender<Delivery>>,
}

impl Message {
    /// Asynchronous message for `key`
    pub fn new(key: ConnectionKey, content: FramedBuffer) -> Self {
        let one_way = key.kind == ConnectionKind::OneWay;
        let effective_size = content.len().unwrap_or_else(|| content.size_hint());
        Self {
            id: 0,
            key,
            content,
            synchronous: false,
            one_way,
            deadline: None,
            effective_size,
            resend_on_failure: true,
            completion: None,
        }
    }

    /// Make the sender wait until the message is written (or replied to)
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Absolute deadline of this message
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Whether the message may be sent again after a transport failure
    pub fn resend_on_failure(mut self, resend: bool) -> Self {
        self.resend_on_failure = resend;
        self
    }

    /// Identifier assigned by the manager
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Target connection
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Whether a sender waits on this message
    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    /// Whether no reply is expected
    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    /// Size used for queue accounting
    pub fn effective_size(&self) -> usize {
        self.effective_size
    }

    /// Whether the message survives a transport failure
    pub fn resends_on_failure(&self) -> bool {
        self.resend_on_failure
    }

    /// Deadline, if assigned
    pub fn finish_time(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the deadline passed at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Message content
    pub fn content_mut(&mut self) -> &mut FramedBuffer {
        &mut self.content
    }

    /// Take the content out of the message
    pub fn into_content(self) -> FramedBuffer {
        self.content
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.key.name = name;
    }

    /// Assign id and default deadline; returns the waiter for synchronous messages
    pub(crate) fn prepare(&mut self, id: u64, default_deadline: Instant) -> Option<oneshot::Receiver<Delivery>> {
        self.id = id;
        self.deadline.get_or_insert(default_deadline);
        if !self.synchronous {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        Some(rx)
    }

    /// Report success to the waiting sender, if any
    pub(crate) fn complete(mut self, reply: Option<FramedBuffer>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Ok(reply));
        }
    }

    /// Report failure exactly once: to the waiting sender while it waits,
    /// otherwise to the dispatch-exception hook
    pub(crate) fn fail(mut self, error: TransportError, handler: &dyn DispatchHandler) {
        if let Some(tx) = self.completion.take() {
            if let Err(Err(error)) = tx.send(Err(error)) {
                // the sender already gave up at its own deadline
                debug!(message = self.id, %error, "failure after sender stopped waiting");
            }
            return;
        }
        handler.dispatch_exception(self, error);
    }
}

impl AsMut<FramedBuffer> for Message {
    fn as_mut(&mut self) -> &mut FramedBuffer {
        &mut self.content
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("synchronous", &self.synchronous)
            .field("one_way", &self.one_way)
            .field("effective_size", &self.effective_size)
            .field("resend_on_failure", &self.resend_on_failure)
            .finish()
    }
}
