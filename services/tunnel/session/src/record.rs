//! Per-connection state.
//!
//! A [`ConnectionRecord`] is one physical channel to a peer. While a
//! long-lived connection is being reestablished, a stub record without a
//! channel holds the pool slot; it shares the outbound queue and sequence
//! counters of the failed record and keeps its send lock held, so senders
//! only ever see a busy connection, never a missing one.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::Result;
use crate::message::ConnectionKey;
use crate::peer::Peer;
use crate::queue::OutboundQueue;
use crate::security::{SecuritySession, NO_SECURITY};

/// Which side opened the physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Dialled by this process; can be reopened locally
    Outbound,
    /// Accepted from the peer; only the peer can reopen it
    Inbound,
}

/// Per-direction sequence counters
#[derive(Debug, Default)]
pub struct Sequences {
    send: AtomicI32,
    recv: AtomicI32,
}

impl Sequences {
    /// Counters starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the next outbound packet
    pub fn send(&self) -> i32 {
        self.send.load(Ordering::Acquire)
    }

    /// Sequence number of the next inbound packet
    pub fn recv(&self) -> i32 {
        self.recv.load(Ordering::Acquire)
    }

    /// Count an acknowledged outbound packet
    pub fn advance_send(&self) -> i32 {
        self.send.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Count a delivered inbound packet
    pub fn advance_recv(&self) -> i32 {
        self.recv.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Restart both directions
    pub fn reset(&self) {
        self.set(0, 0);
    }

    /// Overwrite both directions
    pub fn set(&self, send: i32, recv: i32) {
        self.send.store(send, Ordering::Release);
        self.recv.store(recv, Ordering::Release);
    }
}

/// At most one in-flight send per record
#[derive(Debug, Default)]
pub struct SendLock(AtomicBool);

impl SendLock {
    fn held() -> Self {
        Self(AtomicBool::new(true))
    }

    /// Take the lock if it is free
    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Free the lock
    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Whether a send is in flight
    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Traffic counters of one record
#[derive(Debug, Default)]
pub struct RecordStats {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

/// Copy of [`RecordStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Packets written
    pub packets_sent: u64,
    /// Packets read
    pub packets_received: u64,
    /// Bytes written
    pub bytes_sent: u64,
    /// Bytes read
    pub bytes_received: u64,
    /// Messages written
    pub messages_sent: u64,
    /// Messages dispatched
    pub messages_received: u64,
}

impl RecordStats {
    /// Current values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}

/// Everything needed to build a live record
pub(crate) struct RecordParts<C> {
    pub id: u64,
    pub key: ConnectionKey,
    pub peer: Arc<Peer>,
    pub origin: Origin,
    pub wire_id: Uuid,
    pub queue: Arc<OutboundQueue>,
    pub sequences: Arc<Sequences>,
    pub channel: Arc<C>,
    pub sender_session: Box<dyn SecuritySession>,
    pub listener_session: Box<dyn SecuritySession>,
    pub remote_host_id: i32,
    pub send_lock_held: bool,
}

/// One physical connection to a peer
pub struct ConnectionRecord<C> {
    id: u64,
    key: ConnectionKey,
    peer: Arc<Peer>,
    origin: Origin,
    wire_id: Uuid,
    queue: Arc<OutboundQueue>,
    sequences: Arc<Sequences>,
    channel: Option<Arc<C>>,
    send_lock: SendLock,
    valid: AtomicBool,
    sender_session: Mutex<Option<Box<dyn SecuritySession>>>,
    listener_session: Mutex<Option<Box<dyn SecuritySession>>>,
    security_name: Option<String>,
    remote_host_id: i32,
    created: Instant,
    last_sent: Mutex<Instant>,
    last_received: Mutex<Instant>,
    last_activity: Mutex<Instant>,
    stats: RecordStats,
    reconnecting: AtomicBool,
    retry_requested: AtomicBool,
    handed_off: AtomicBool,
    accepted: Notify,
}

impl<C> ConnectionRecord<C> {
    pub(crate) fn live(parts: RecordParts<C>) -> Self {
        let now = Instant::now();
        let name = parts.sender_session.name();
        let security_name = (name != NO_SECURITY).then(|| name.to_string());
        Self {
            id: parts.id,
            key: parts.key,
            peer: parts.peer,
            origin: parts.origin,
            wire_id: parts.wire_id,
            queue: parts.queue,
            sequences: parts.sequences,
            channel: Some(parts.channel),
            send_lock: SendLock(AtomicBool::new(parts.send_lock_held)),
            valid: AtomicBool::new(true),
            sender_session: Mutex::new(Some(parts.sender_session)),
            listener_session: Mutex::new(Some(parts.listener_session)),
            security_name,
            remote_host_id: parts.remote_host_id,
            created: now,
            last_sent: Mutex::new(now),
            last_received: Mutex::new(now),
            last_activity: Mutex::new(now),
            stats: RecordStats::default(),
            reconnecting: AtomicBool::new(false),
            retry_requested: AtomicBool::new(false),
            handed_off: AtomicBool::new(false),
            accepted: Notify::new(),
        }
    }

    /// Stand-in for `failed` while it is being reestablished
    pub(crate) fn stub(failed: &Self, id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            key: failed.key.clone(),
            peer: failed.peer.clone(),
            origin: failed.origin,
            wire_id: failed.wire_id,
            queue: failed.queue.clone(),
            sequences: failed.sequences.clone(),
            channel: None,
            send_lock: SendLock::held(),
            valid: AtomicBool::new(true),
            sender_session: Mutex::new(None),
            listener_session: Mutex::new(None),
            security_name: failed.security_name.clone(),
            remote_host_id: failed.remote_host_id,
            created: now,
            last_sent: Mutex::new(now),
            last_received: Mutex::new(now),
            last_activity: Mutex::new(now),
            stats: RecordStats::default(),
            reconnecting: AtomicBool::new(true),
            retry_requested: AtomicBool::new(false),
            handed_off: AtomicBool::new(false),
            accepted: Notify::new(),
        }
    }

    /// Debug identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pool key
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Remote peer
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Which side dialled
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Identifier of this logical connection on the wire, stable across
    /// reconnects
    pub fn wire_id(&self) -> Uuid {
        self.wire_id
    }

    /// Outbound queue, shared with stubs and successors
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    /// Sequence counters, shared with stubs and successors
    pub fn sequences(&self) -> &Arc<Sequences> {
        &self.sequences
    }

    /// Live channel, `None` for a stub
    pub fn channel(&self) -> Option<&Arc<C>> {
        self.channel.as_ref()
    }

    /// Whether this record only holds the slot during reconnection
    pub fn is_stub(&self) -> bool {
        self.channel.is_none()
    }

    /// Send lock
    pub fn send_lock(&self) -> &SendLock {
        &self.send_lock
    }

    /// Whether the record may still carry traffic
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the record failed; returns whether it was valid before
    pub fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }

    /// Host id the remote announced for this connection
    pub fn remote_host_id(&self) -> i32 {
        self.remote_host_id
    }

    /// Security session name
    pub fn security_name(&self) -> Option<&str> {
        self.security_name.as_deref()
    }

    /// Protect an outbound packet with the sender-path session
    pub fn encrypt(&self, plain: Bytes) -> Result<Bytes> {
        match self.sender_session.lock().as_mut() {
            Some(session) => session.encrypt(plain),
            None => Ok(plain),
        }
    }

    /// Unwrap an inbound packet with the listener-path session
    pub fn decrypt(&self, cipher: Bytes) -> Result<Bytes> {
        match self.listener_session.lock().as_mut() {
            Some(session) => session.decrypt(cipher),
            None => Ok(cipher),
        }
    }

    /// Account an outbound packet
    pub fn touch_sent(&self, bytes: usize, messages: usize) {
        let now = Instant::now();
        *self.last_sent.lock() = now;
        if messages > 0 {
            *self.last_activity.lock() = now;
        }
        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.stats.messages_sent.fetch_add(messages as u64, Ordering::Relaxed);
    }

    /// Account an inbound packet
    pub fn touch_received(&self, bytes: usize) {
        *self.last_received.lock() = Instant::now();
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Account a dispatched inbound message
    pub fn touch_dispatched(&self) {
        *self.last_activity.lock() = Instant::now();
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Creation time
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Time since the last packet was written, pings included
    pub fn idle_sending(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_sent.lock())
    }

    /// Time since the last packet was read
    pub fn idle_receiving(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_received.lock())
    }

    /// Time since a message moved in either direction
    pub fn inactive_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    /// Traffic counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Claim the reconnection of this record; false if one is already running
    pub(crate) fn begin_reconnect(&self) -> bool {
        let claimed = self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !claimed {
            self.retry_requested.store(true, Ordering::Release);
        }
        claimed
    }

    /// Whether a reconnection is running for this record
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    /// Consume a pending retry request
    pub(crate) fn take_retry_request(&self) -> bool {
        self.retry_requested.swap(false, Ordering::AcqRel)
    }

    /// Mark the queue as adopted by a successor; returns false if it already was
    pub(crate) fn hand_off(&self) -> bool {
        !self.handed_off.swap(true, Ordering::AcqRel)
    }

    /// Whether a successor adopted the queue
    pub(crate) fn is_handed_off(&self) -> bool {
        self.handed_off.load(Ordering::Acquire)
    }

    /// Signal a stub that the peer reconnected on its own
    pub(crate) fn notify_accepted(&self) {
        self.accepted.notify_one();
    }

    /// Wait until [`ConnectionRecord::notify_accepted`] is called
    pub(crate) async fn accepted(&self) {
        self.accepted.notified().await
    }
}

impl<C> fmt::Debug for ConnectionRecord<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("origin", &self.origin)
            .field("stub", &self.is_stub())
            .field("valid", &self.is_valid())
            .field("queued", &self.queue.len())
            .finish()
    }
}
