//! Connection manager: the pool of connection records and the send/receive
//! paths running over them.
//!
//! One manager serves one transport. `send` resolves (or opens) the record
//! for a message's connection key, queues the message and makes sure exactly
//! one drain task per record is writing packets. Receiving is continuous for
//! long-lived connections and dispatches every inbound message, in wire
//! order, to the [`DispatchHandler`].
//!
//! Failures are classified by [`TransportError::class`]: recoverable failures
//! of long-lived connections go to the reconnection engine, everything else
//! closes the record.

use bytes::Bytes;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tunnel_wire::{pack_labelled, FramedBuffer, LabelledReader, LabelledWriter};

use crate::config::TransportConfig;
use crate::error::{ErrorClass, Result, TransportError};
use crate::handler::{DispatchHandler, InboundMessage};
use crate::message::{ConnectionKey, IdGenerator, Message};
use crate::peer::{HostObservation, Peer, PeerRegistry};
use crate::queue::{Batch, OutboundQueue, QueueLimits};
use crate::record::{ConnectionRecord, Origin, RecordParts, Sequences, StatsSnapshot};
use crate::security::SecuritySessionFactory;
use crate::transport::{Accepted, Channel, ConnectRequest, Connector, LocalIdentity};

/// Connection record of a manager using connector `K`
pub type Record<K> = ConnectionRecord<<K as Connector>::Channel>;

/// Attempts to find a record whose queue still admits messages
const RESOLVE_ATTEMPTS: usize = 3;

/// Lifecycle events of long-lived connections
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection was opened or accepted
    Established {
        /// Connection key
        key: ConnectionKey,
        /// Which side opened it
        origin: Origin,
    },
    /// A connection failed and is being reestablished
    Reestablishing {
        /// Connection key
        key: ConnectionKey,
        /// The failure
        cause: TransportError,
    },
    /// A failed connection is usable again
    Reestablished {
        /// Connection key
        key: ConnectionKey,
    },
    /// A connection is gone for good
    Closed {
        /// Connection key
        key: ConnectionKey,
        /// Why it closed
        reason: TransportError,
    },
}

/// Point-in-time view of one record
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    /// Connection key
    pub key: ConnectionKey,
    /// Record debug identifier
    pub id: u64,
    /// Which side opened it
    pub origin: Origin,
    /// Whether the record only holds the slot during reconnection
    pub reestablishing: bool,
    /// Messages waiting to be sent
    pub queued: usize,
    /// Bytes waiting to be sent
    pub queued_bytes: usize,
    /// Time since the record was created
    pub age: Duration,
    /// Traffic counters
    pub stats: StatsSnapshot,
}

pub(crate) struct ManagerInner<K: Connector> {
    pub(crate) config: Arc<TransportConfig>,
    pub(crate) connector: K,
    pub(crate) local: LocalIdentity,
    pub(crate) pool: DashMap<ConnectionKey, Arc<Record<K>>>,
    establishing: DashMap<String, Arc<Mutex<()>>>,
    pub(crate) peers: PeerRegistry,
    handler: Arc<dyn DispatchHandler>,
    security: Arc<dyn SecuritySessionFactory>,
    events: broadcast::Sender<ConnectionEvent>,
    message_ids: IdGenerator,
    pub(crate) record_ids: IdGenerator,
    pub(crate) shutdown: watch::Sender<bool>,
}

/// Connection pool and message paths of one transport
pub struct ConnectionManager<K: Connector> {
    pub(crate) inner: Arc<ManagerInner<K>>,
}

impl<K: Connector> Clone for ConnectionManager<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Connector> ConnectionManager<K> {
    /// Create a manager and start its housekeeping timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: TransportConfig,
        local_uri: impl Into<String>,
        connector: K,
        handler: Arc<dyn DispatchHandler>,
        security: Arc<dyn SecuritySessionFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let local = LocalIdentity::new(local_uri);
        info!(uri = %local.uri, host_id = local.host_id, "starting connection manager");

        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        let manager = Self {
            inner: Arc::new(ManagerInner {
                peers: PeerRegistry::new(config.peer_lease),
                config: Arc::new(config),
                connector,
                local,
                pool: DashMap::new(),
                establishing: DashMap::new(),
                handler,
                security,
                events,
                message_ids: IdGenerator::new(),
                record_ids: IdGenerator::new(),
                shutdown,
            }),
        };
        manager.spawn_housekeeping();
        Ok(manager)
    }

    /// Identity announced to peers
    pub fn local(&self) -> &LocalIdentity {
        &self.inner.local
    }

    /// Active configuration
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Known peers
    pub fn peers(&self) -> &PeerRegistry {
        &self.inner.peers
    }

    /// The transport connector
    pub fn connector(&self) -> &K {
        &self.inner.connector
    }

    /// Subscribe to connection lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Whether [`ConnectionManager::shutdown`] was called
    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Send a message.
    ///
    /// Asynchronous messages return once queued; their failures go to the
    /// dispatch-exception hook. Synchronous messages wait until the packet
    /// carrying them was written, or for invocations until the reply arrived,
    /// bounded by the message deadline.
    pub async fn send(&self, message: Message) -> Result<Option<FramedBuffer>> {
        if self.is_shut_down() {
            return Err(TransportError::Shutdown);
        }

        let kind = message.key().kind;
        let mut message = if kind.expects_reply() {
            message.synchronous(true)
        } else {
            message
        };
        if !kind.is_long_lived() {
            message.set_name(Uuid::new_v4().to_string());
        }

        let config = &self.inner.config;
        let ttl = if kind.expects_reply() {
            config.invocation_timeout
        } else {
            config.send_timeout
        };
        let waiter = message.prepare(self.inner.message_ids.next_id(), Instant::now() + ttl);
        let deadline = message.finish_time().unwrap_or_else(|| Instant::now() + ttl);
        let expired = || {
            if kind.expects_reply() {
                TransportError::ServerDidNotReply
            } else {
                TransportError::SendTimeout
            }
        };

        let key = message.key().clone();
        let record = timeout_at(deadline, self.resolve_open(&key))
            .await
            .map_err(|_| expired())??;

        if let Err(error) = record.queue().enqueue(message) {
            if matches!(error, TransportError::QueueOverloaded { .. }) {
                self.close_record(&record, error.clone());
            }
            return Err(error);
        }
        self.pump(&record);

        let Some(waiter) = waiter else {
            return Ok(None);
        };
        match timeout_at(deadline, waiter).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => Err(TransportError::ConnectionClosed(format!("{key} dropped the message"))),
            Err(_) => Err(expired()),
        }
    }

    /// Run a single request/reply exchange with `peer`
    pub async fn invoke(&self, peer: &str, content: FramedBuffer) -> Result<Option<FramedBuffer>> {
        self.send(Message::new(ConnectionKey::invocation(peer), content)).await
    }

    /// Close a connection explicitly; queued messages fail with
    /// `ClosedManually`
    pub fn release(&self, key: &ConnectionKey) -> bool {
        let Some(record) = self.inner.pool.get(key).map(|entry| entry.value().clone()) else {
            return false;
        };
        info!(connection = %key, "releasing connection");
        self.close_record(&record, TransportError::ClosedManually);
        true
    }

    /// Close every connection and stop background work
    pub fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let records: Vec<Arc<Record<K>>> = self.inner.pool.iter().map(|entry| entry.value().clone()).collect();
        info!(connections = records.len(), "shutting down connection manager");
        for record in records {
            self.close_record(&record, TransportError::Shutdown);
        }
    }

    /// View of every record in the pool
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let now = Instant::now();
        self.inner
            .pool
            .iter()
            .map(|entry| {
                let record = entry.value();
                ConnectionSnapshot {
                    key: record.key().clone(),
                    id: record.id(),
                    origin: record.origin(),
                    reestablishing: record.is_stub(),
                    queued: record.queue().len(),
                    queued_bytes: record.queue().bytes(),
                    age: now.saturating_duration_since(record.created()),
                    stats: record.stats(),
                }
            })
            .collect()
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        // no subscriber is fine
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn new_queue(&self) -> Arc<OutboundQueue> {
        let config = &self.inner.config;
        Arc::new(OutboundQueue::new(
            QueueLimits {
                max_items: config.max_queued_items,
                max_bytes: config.max_queued_bytes,
                max_message_size: config.max_message_size,
            },
            self.inner.handler.clone(),
        ))
    }

    pub(crate) fn connect_request(&self, key: &ConnectionKey, peer: &Arc<Peer>, wire_id: Uuid, sequences: Arc<Sequences>, reset: bool) -> ConnectRequest {
        ConnectRequest {
            key: key.clone(),
            peer: peer.clone(),
            wire_id,
            sequences,
            reset,
            local: self.inner.local.clone(),
            config: self.inner.config.clone(),
            security: self.inner.security.clone(),
        }
    }

    /// Security factory and session name for transports establishing
    /// connections
    pub(crate) fn security(&self) -> (&Arc<dyn SecuritySessionFactory>, Option<&str>) {
        (&self.inner.security, self.inner.config.security_session.as_deref())
    }

    fn establishing_lock(&self, peer: &str) -> Arc<Mutex<()>> {
        self.inner.establishing.entry(peer.to_string()).or_default().clone()
    }

    /// Record in the slot if it can take messages; a record under
    /// reconnection counts, its queue is carried over
    pub(crate) fn usable(&self, key: &ConnectionKey) -> Option<Arc<Record<K>>> {
        let record = self.inner.pool.get(key)?.value().clone();
        let open = (record.is_valid() || record.is_reconnecting()) && record.queue().disposed().is_none();
        open.then_some(record)
    }

    async fn resolve_open(&self, key: &ConnectionKey) -> Result<Arc<Record<K>>> {
        let mut last_error = None;
        for _ in 0..RESOLVE_ATTEMPTS {
            match self.resolve(key).await {
                Ok(record) if record.queue().disposed().is_none() => return Ok(record),
                Ok(record) => last_error = record.queue().disposed(),
                Err(error) => return Err(error),
            }
        }
        Err(last_error.unwrap_or_else(|| TransportError::ConnectionClosed(key.to_string())))
    }

    /// Find the record for `key`, opening a connection under the peer's
    /// establishing lock if there is none
    async fn resolve(&self, key: &ConnectionKey) -> Result<Arc<Record<K>>> {
        if let Some(record) = self.usable(key) {
            return Ok(record);
        }

        let lock = self.establishing_lock(&key.peer);
        let _guard = lock.lock().await;
        if let Some(record) = self.usable(key) {
            return Ok(record);
        }
        if !self.inner.connector.can_dial() {
            return Err(TransportError::ConnectionClosed(format!(
                "no connection from {} and this side cannot dial",
                key.peer
            )));
        }

        match self.open(key).await {
            Ok(record) => Ok(record),
            // the peer may have connected to us while we were dialling
            Err(error) => self.usable(key).ok_or(error),
        }
    }

    async fn open(&self, key: &ConnectionKey) -> Result<Arc<Record<K>>> {
        let peer = self.inner.peers.resolve(&key.peer);
        let sequences = Arc::new(Sequences::new());
        let wire_id = Uuid::new_v4();
        let request = self.connect_request(key, &peer, wire_id, sequences.clone(), true);

        debug!(connection = %key, "opening connection");
        let established = timeout(self.inner.config.connect_timeout, self.inner.connector.connect(request))
            .await
            .map_err(|_| TransportError::ConnectTimeout(key.peer.clone()))??;

        self.observe_remote(&peer, established.remote.host_id, key);
        let record = Arc::new(ConnectionRecord::live(RecordParts {
            id: self.inner.record_ids.next_id(),
            key: key.clone(),
            peer,
            origin: Origin::Outbound,
            wire_id,
            queue: self.new_queue(),
            sequences,
            channel: established.channel,
            sender_session: established.sender_session,
            listener_session: established.listener_session,
            remote_host_id: established.remote.host_id,
            send_lock_held: false,
        }));
        self.inner.pool.insert(key.clone(), record.clone());

        if key.kind.is_long_lived() {
            info!(connection = %key, record = record.id(), "connection established");
            self.emit(ConnectionEvent::Established {
                key: key.clone(),
                origin: Origin::Outbound,
            });
            self.spawn_receiver(record.clone());
        }
        Ok(record)
    }

    /// Register a connection opened by the remote.
    ///
    /// A stub in the slot hands its queue over; a live record is replaced
    /// unless both sides dialled and the local URI wins the tie-break, in
    /// which case the new connection is refused with `PoolFull`.
    pub(crate) async fn accept(&self, accepted: Accepted<K::Channel>) -> Result<Arc<Record<K>>> {
        let Accepted {
            key,
            remote,
            version,
            wire_id,
            channel,
            sequences,
            sender_session,
            listener_session,
        } = accepted;

        let peer = self.inner.peers.resolve(&key.peer);
        peer.set_protocol_version(version);
        self.observe_remote(&peer, remote.host_id, &key);

        let lock = self.establishing_lock(&key.peer);
        let _guard = lock.lock().await;

        let existing = self.inner.pool.get(&key).map(|entry| entry.value().clone());
        let (queue, inherited) = match &existing {
            Some(current) if current.is_stub() && current.is_valid() => (current.queue().clone(), true),
            Some(current) if current.is_valid() || current.is_reconnecting() => {
                if current.is_valid() && current.origin() == Origin::Outbound && self.inner.local.uri < key.peer {
                    debug!(connection = %key, "both sides dialled, keeping the local connection");
                    let refusal = TransportError::PoolFull(format!("{key} is already connected"));
                    channel.close(&refusal);
                    return Err(refusal);
                }
                current.invalidate();
                current.hand_off();
                if let Some(old) = current.channel() {
                    old.close(&TransportError::ClosedManually);
                }
                debug!(connection = %key, replaced = current.id(), "accepted connection replaces the current one");
                (current.queue().clone(), true)
            }
            _ => (self.new_queue(), false),
        };

        let record = Arc::new(ConnectionRecord::live(RecordParts {
            id: self.inner.record_ids.next_id(),
            key: key.clone(),
            peer,
            origin: Origin::Inbound,
            wire_id,
            queue,
            sequences,
            channel,
            sender_session,
            listener_session,
            remote_host_id: remote.host_id,
            send_lock_held: inherited,
        }));
        self.inner.pool.insert(key.clone(), record.clone());

        let reestablished = match existing {
            Some(stub) if stub.is_stub() && inherited => {
                stub.invalidate();
                stub.notify_accepted();
                true
            }
            _ => false,
        };

        if key.kind.is_long_lived() {
            if reestablished {
                info!(connection = %key, record = record.id(), "connection reestablished by peer");
                self.emit(ConnectionEvent::Reestablished { key: key.clone() });
            } else {
                info!(connection = %key, record = record.id(), "connection accepted");
                self.emit(ConnectionEvent::Established {
                    key: key.clone(),
                    origin: Origin::Inbound,
                });
            }
            self.spawn_receiver(record.clone());
        }
        if inherited {
            let this = self.clone();
            let drained = record.clone();
            tokio::spawn(async move { this.drain(drained).await });
        }
        Ok(record)
    }

    /// Note the remote host id; a restarted peer loses every other
    /// connection of its previous incarnation
    pub(crate) fn observe_remote(&self, peer: &Arc<Peer>, host_id: i32, keep: &ConnectionKey) {
        let HostObservation::Restarted { previous } = self.inner.peers.observe_host(peer, host_id) else {
            return;
        };
        let stale: Vec<Arc<Record<K>>> = self
            .inner
            .pool
            .iter()
            .filter(|entry| entry.key().peer == peer.uri() && entry.key() != keep)
            .map(|entry| entry.value().clone())
            .collect();
        warn!(
            peer = peer.uri(),
            previous,
            current = host_id,
            stale = stale.len(),
            "peer restarted, closing connections of the previous incarnation"
        );
        for record in stale {
            self.close_record(&record, TransportError::PeerRestarted(peer.uri().to_string()));
        }
    }

    /// Start a drain task unless one is running
    pub(crate) fn pump(&self, record: &Arc<Record<K>>) {
        if record.send_lock().try_acquire() {
            let this = self.clone();
            let record = record.clone();
            tokio::spawn(async move { this.drain(record).await });
            return;
        }
        // a stub that already left the slot never releases its lock; the
        // record that adopted its queue drains instead
        if record.is_stub() && !record.is_valid() {
            if let Some(current) = self.usable(record.key()) {
                if !current.is_stub() && !Arc::ptr_eq(&current, record) {
                    self.pump(&current);
                }
            }
        }
    }

    /// Write queued messages until the queue is empty. Runs with the send
    /// lock held; a failed send keeps the lock for the reconnection.
    pub(crate) async fn drain(&self, record: Arc<Record<K>>) {
        loop {
            if !record.is_valid() {
                record.send_lock().release();
                return;
            }

            let batch = match record.queue().take_parked() {
                Some(batch) => self.unpark(&record, batch),
                None => self.pack(&record),
            };
            if batch.is_empty() {
                record.send_lock().release();
                // a sender may have queued after the last dequeue
                if record.queue().is_empty() || !record.send_lock().try_acquire() {
                    return;
                }
                continue;
            }

            let kind = record.key().kind;
            let bound = if kind.expects_reply() {
                batch
                    .messages
                    .first()
                    .and_then(Message::finish_time)
                    .unwrap_or_else(|| Instant::now() + self.inner.config.invocation_timeout)
            } else {
                Instant::now() + self.inner.config.send_timeout
            };

            match self.transmit(&record, batch.packet.clone(), bound, batch.messages.len()).await {
                Ok(reply) => {
                    debug!(connection = %record.key(), messages = batch.messages.len(), "packet sent");
                    self.complete(&record, batch, reply);
                    if !kind.is_long_lived() {
                        self.close_record(&record, TransportError::ClosedManually);
                        return;
                    }
                }
                Err(error) => {
                    self.send_failed(&record, batch, error);
                    return;
                }
            }
        }
    }

    /// Pack queued messages into one labelled packet
    fn pack(&self, record: &Record<K>) -> Batch {
        let config = &self.inner.config;
        let queue = record.queue();
        // short-lived kinds carry exactly one message per connection
        let mut budget = if record.key().kind.is_long_lived() { usize::MAX } else { 1 };
        let (packet, messages) = pack_labelled(
            config.recommended_packet_size,
            config.chunk_size,
            || {
                budget = budget.checked_sub(1)?;
                queue.dequeue()
            },
            |message, error| {
                warn!(connection = %record.key(), message = message.id(), %error, "message content unreadable");
                message.fail(error.into(), queue.handler().as_ref());
            },
        );
        Self::batch(packet, messages)
    }

    /// A parked packet goes out unchanged unless messages in it expired while
    /// it waited; those are released and the rest packed again.
    fn unpark(&self, record: &Record<K>, batch: Batch) -> Batch {
        let now = Instant::now();
        if !batch.messages.iter().any(|message| message.is_expired(now)) {
            return batch;
        }

        let queue = record.queue();
        let (expired, live): (Vec<_>, Vec<_>) = batch.messages.into_iter().partition(|message| message.is_expired(now));
        debug!(connection = %record.key(), expired = expired.len(), "dropping expired messages from parked packet");
        queue.release(expired, &TransportError::SendTimeout);

        let handler = queue.handler().as_ref();
        let mut resend = Vec::with_capacity(live.len());
        for mut message in live {
            match message.content_mut().rewind() {
                Ok(()) => resend.push(message),
                Err(error) => message.fail(error.into(), handler),
            }
        }

        let mut resend = resend.into_iter();
        let (packet, messages) = pack_labelled(
            usize::MAX,
            self.inner.config.chunk_size,
            || resend.next(),
            |message, error| message.fail(error.into(), handler),
        );
        Self::batch(packet, messages)
    }

    fn batch(packet: Bytes, messages: Vec<Message>) -> Batch {
        if messages.is_empty() {
            return Batch {
                packet: Bytes::new(),
                messages,
            };
        }
        Batch { packet, messages }
    }

    /// Encrypt and write one packet within `bound`
    pub(crate) async fn transmit(&self, record: &Record<K>, packet: Bytes, bound: Instant, messages: usize) -> Result<Option<Bytes>> {
        let Some(channel) = record.channel() else {
            return Err(TransportError::ConnectionClosed(format!("{} is reestablishing", record.key())));
        };
        let expect_reply = record.key().kind.expects_reply();
        let packet = record.encrypt(packet)?;
        let len = packet.len();

        let reply = match timeout_at(bound, channel.send_packet(packet, expect_reply)).await {
            Ok(result) => result?,
            Err(_) if expect_reply => return Err(TransportError::ServerDidNotReply),
            Err(_) => {
                return Err(TransportError::Io(Arc::new(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "packet send timed out",
                ))))
            }
        };
        record.touch_sent(len, messages);
        Ok(reply)
    }

    fn complete(&self, record: &Record<K>, batch: Batch, reply: Option<Bytes>) {
        let handler = record.queue().handler().clone();
        if !record.key().kind.expects_reply() {
            for message in batch.messages {
                message.complete(None);
            }
            return;
        }

        let answer = reply
            .ok_or(TransportError::ServerDidNotReply)
            .and_then(|cipher| {
                record.touch_received(cipher.len());
                let plain = record.decrypt(cipher)?;
                Ok(LabelledReader::new(plain, self.inner.config.max_message_size)
                    .next()
                    .transpose()?)
            });
        let mut messages = batch.messages.into_iter();
        match answer {
            Ok(reply) => {
                if let Some(first) = messages.next() {
                    first.complete(reply);
                }
                messages.for_each(|message| message.complete(None));
            }
            Err(error) => {
                warn!(connection = %record.key(), %error, "invocation reply unusable");
                messages.for_each(|message| message.fail(error.clone(), handler.as_ref()));
            }
        }
    }

    /// Keep what can be resent and route the failure
    fn send_failed(&self, record: &Arc<Record<K>>, batch: Batch, error: TransportError) {
        let key = record.key().clone();
        warn!(connection = %key, messages = batch.messages.len(), %error, "send failed");

        let queue = record.queue();
        let retained = key.kind.is_long_lived() && error.is_recoverable() && !self.is_shut_down();
        if retained && batch.messages.iter().all(Message::resends_on_failure) {
            queue.park(batch);
        } else if retained {
            let mut resend = Vec::new();
            let mut give_up = Vec::new();
            for mut message in batch.messages {
                if message.resends_on_failure() && message.content_mut().rewind().is_ok() {
                    resend.push(message);
                } else {
                    give_up.push(message);
                }
            }
            queue.requeue_front(resend);
            queue.release(give_up, &error);
        } else {
            queue.release(batch.messages, &error);
        }

        self.on_failure(record, error);

        // work parked on a record that was already replaced
        if !record.is_reconnecting() {
            if let Some(current) = self.usable(&key) {
                if !Arc::ptr_eq(&current, record) {
                    self.pump(&current);
                }
            }
        }
    }

    /// Route a failure of `record` to the reconnection engine or close it
    pub(crate) fn on_failure(&self, record: &Arc<Record<K>>, error: TransportError) {
        if !record.is_valid() && !record.is_reconnecting() {
            return;
        }
        if record.key().kind.is_long_lived() && error.is_recoverable() && !self.is_shut_down() {
            self.start_reconnect(record.clone(), error);
            return;
        }

        let critical = error.class() == ErrorClass::Critical;
        if critical {
            error!(connection = %record.key(), %error, "connection failed permanently");
        } else {
            warn!(connection = %record.key(), %error, "closing connection");
        }
        let peer = record.key().peer.clone();
        self.close_record(record, error);
        if critical {
            self.release_peer_if_idle(&peer);
        }
    }

    /// Tear a record down: invalidate, close the channel, vacate its slot
    /// and fail whatever it still queues
    pub(crate) fn close_record(&self, record: &Arc<Record<K>>, reason: TransportError) {
        let was_valid = record.invalidate();
        if let Some(channel) = record.channel() {
            channel.close(&reason);
        }
        let removed = self
            .inner
            .pool
            .remove_if(record.key(), |_, current| Arc::ptr_eq(current, record))
            .is_some();
        if !record.is_handed_off() {
            record.queue().dispose(reason.clone());
        }

        if (was_valid || removed) && record.key().kind.is_long_lived() {
            info!(connection = %record.key(), record = record.id(), %reason, "connection closed");
            self.emit(ConnectionEvent::Closed {
                key: record.key().clone(),
                reason,
            });
        }
    }

    /// Forget a peer once none of its connections remain
    pub(crate) fn release_peer_if_idle(&self, uri: &str) {
        let busy = self.inner.pool.iter().any(|entry| entry.key().peer == uri);
        if !busy {
            self.inner.peers.release(uri);
            self.inner.establishing.remove(uri);
        }
    }

    /// Receive continuously on a long-lived record
    pub(crate) fn spawn_receiver(&self, record: Arc<Record<K>>) {
        let Some(channel) = record.channel().cloned() else {
            return;
        };
        let this = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() || !record.is_valid() {
                    break;
                }
                let result = tokio::select! {
                    _ = shutdown.changed() => break,
                    result = channel.recv_packet() => result,
                };
                if !record.is_valid() {
                    break;
                }
                let outcome = match result {
                    Ok(None) => continue,
                    Ok(Some(packet)) => this.receive_packet(&record, packet).await,
                    Err(error) => Err(error),
                };
                if let Err(error) = outcome {
                    this.on_failure(&record, error);
                    break;
                }
            }
            debug!(connection = %record.key(), record = record.id(), "receive loop stopped");
        });
    }

    /// Decrypt, unpack and dispatch one inbound packet
    pub(crate) async fn receive_packet(&self, record: &Record<K>, packet: Bytes) -> Result<()> {
        record.touch_received(packet.len());
        let plain = record.decrypt(packet)?;
        for content in LabelledReader::new(plain, self.inner.config.max_message_size) {
            self.dispatch(record, content?).await;
        }
        Ok(())
    }

    /// Serve one inbound packet of a single-exchange connection; returns
    /// the encrypted reply packet for invocations
    pub(crate) async fn handle_exchange(&self, record: &Record<K>, packet: Bytes) -> Result<Option<Bytes>> {
        record.touch_received(packet.len());
        let plain = record.decrypt(packet)?;
        let mut reply = None;
        for content in LabelledReader::new(plain, self.inner.config.max_message_size) {
            let answer = self.dispatch(record, content?).await;
            if reply.is_none() {
                reply = answer;
            }
        }
        if !record.key().kind.expects_reply() {
            return Ok(None);
        }

        let mut writer = LabelledWriter::new(self.inner.config.chunk_size);
        if let Some(mut reply) = reply {
            writer.push_reader(&mut reply)?;
        }
        let packet = record.encrypt(writer.finish())?;
        record.touch_sent(packet.len(), 1);
        Ok(Some(packet))
    }

    async fn dispatch(&self, record: &Record<K>, content: FramedBuffer) -> Option<FramedBuffer> {
        record.touch_dispatched();
        let key = record.key();
        self.inner
            .handler
            .handle_message(InboundMessage {
                content,
                peer: record.peer().clone(),
                kind: key.kind,
                connection_name: key.name.clone(),
                is_synchronous: key.kind.is_synchronous(),
                security_session: record.security_name().map(str::to_string),
            })
            .await
    }

    /// Send an empty labelled stream if the record is idle
    pub(crate) fn ping(&self, record: &Arc<Record<K>>) {
        if record.is_stub() || !record.send_lock().try_acquire() {
            return;
        }
        let this = self.clone();
        let record = record.clone();
        tokio::spawn(async move {
            let packet = LabelledWriter::new(this.inner.config.chunk_size).finish();
            let bound = Instant::now() + this.inner.config.send_timeout;
            match this.transmit(&record, packet, bound, 0).await {
                Ok(_) => {
                    debug!(connection = %record.key(), "ping sent");
                    record.send_lock().release();
                    this.pump(&record);
                }
                Err(error) => {
                    warn!(connection = %record.key(), %error, "ping failed");
                    this.on_failure(&record, error);
                }
            }
        });
    }
}

impl<K: Connector> std::fmt::Debug for ConnectionManager<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local", &self.inner.local)
            .field("connections", &self.inner.pool.len())
            .field("peers", &self.inner.peers.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::security::{NoSecurity, NoSecurityFactory};
    use crate::transport::mock::{MockConnector, MockState, SendOutcome};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::Ordering;
    use tunnel_wire::{unpack_labelled, Hello};

    pub(crate) const PEER: &str = "tcp://remote:7000";

    /// Handler collecting inbound payloads and reported failures
    #[derive(Debug, Default)]
    pub(crate) struct CollectingHandler {
        pub(crate) received: SyncMutex<Vec<(String, Vec<u8>)>>,
        pub(crate) failures: SyncMutex<Vec<(u64, String)>>,
        pub(crate) reply: SyncMutex<Option<Vec<u8>>>,
    }

    #[async_trait]
    impl DispatchHandler for CollectingHandler {
        async fn handle_message(&self, mut message: InboundMessage) -> Option<FramedBuffer> {
            let payload = message.content.to_bytes().map(|b| b.to_vec()).unwrap_or_default();
            self.received.lock().push((message.connection_name.clone(), payload));
            self.reply.lock().clone().map(FramedBuffer::from_bytes)
        }

        fn dispatch_exception(&self, message: Message, error: TransportError) {
            self.failures.lock().push((message.id(), error.to_string()));
        }
    }

    pub(crate) fn test_config() -> TransportConfig {
        TransportConfig {
            housekeeping_interval: Duration::from_secs(3600),
            reconnect_interval: Duration::from_millis(50),
            ..TransportConfig::default()
        }
    }

    fn setup(config: TransportConfig) -> (ConnectionManager<MockConnector>, Arc<MockState>, Arc<CollectingHandler>) {
        let connector = MockConnector::new();
        let state = connector.state.clone();
        let handler = Arc::new(CollectingHandler::default());
        let manager = ConnectionManager::new(
            config,
            "tcp://local:7000",
            connector,
            handler.clone(),
            Arc::new(NoSecurityFactory),
        )
        .unwrap();
        (manager, state, handler)
    }

    fn message(payload: Vec<u8>) -> Message {
        Message::new(ConnectionKey::persistent(PEER), FramedBuffer::from_bytes(payload))
    }

    pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    pub(crate) async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>, wanted: fn(&ConnectionEvent) -> bool) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let event = events.recv().await.unwrap();
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not emitted")
    }

    fn labelled(payloads: &[&[u8]]) -> Bytes {
        let mut writer = LabelledWriter::new(1024);
        for payload in payloads {
            writer.push_bytes(payload);
        }
        writer.finish()
    }

    fn accepted(connector: &MockConnector, key: ConnectionKey, host_id: i32) -> (Accepted<crate::transport::mock::MockChannel>, tokio::sync::mpsc::UnboundedSender<Result<Bytes>>) {
        let (channel, feed) = connector.channel();
        let remote = Hello {
            uri: key.peer.clone(),
            host_id,
        };
        (
            Accepted {
                key,
                remote,
                version: tunnel_wire::WIRE_VERSION,
                wire_id: Uuid::new_v4(),
                channel,
                sequences: Arc::new(Sequences::new()),
                sender_session: Box::new(NoSecurity),
                listener_session: Box::new(NoSecurity),
            },
            feed,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_send_in_flight() {
        let (manager, state, _) = setup(test_config());
        *state.send_delay.lock() = Duration::from_millis(2);

        let mut tasks = Vec::new();
        for task in 0..8u8 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..10u8 {
                    manager.send(message(vec![task, i])).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        wait_until(|| state.payloads().len() == 80).await;
        assert_eq!(state.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(state.connects.load(Ordering::SeqCst), 1);

        let payloads = state.payloads();
        for task in 0..8u8 {
            let order: Vec<u8> = payloads.iter().filter(|p| p[0] == task).map(|p| p[1]).collect();
            assert_eq!(order, (0..10).collect::<Vec<u8>>());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_queued_behind_a_send_share_one_packet() {
        let (manager, state, _) = setup(test_config());
        *state.send_delay.lock() = Duration::from_millis(100);

        manager.send(message(b"A".to_vec())).await.unwrap();
        wait_until(|| state.in_flight.load(Ordering::SeqCst) == 1).await;
        manager.send(message(b"B".to_vec())).await.unwrap();
        manager.send(message(b"C".to_vec())).await.unwrap();

        wait_until(|| state.payloads().len() == 3).await;
        assert_eq!(state.sent.lock().len(), 2);
        assert_eq!(state.payloads(), vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_synchronous_senders_behind_a_send_share_one_packet() {
        let (manager, state, _) = setup(test_config());
        *state.send_delay.lock() = Duration::from_millis(300);
        let key = ConnectionKey::persistent(PEER);
        let queued = |manager: &ConnectionManager<MockConnector>| {
            manager.inner.pool.get(&key).map_or(0, |record| record.queue().len())
        };

        let spawn_send = |payload: &'static [u8]| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send(message(payload.to_vec()).synchronous(true)).await })
        };

        let mut senders = vec![spawn_send(b"X")];
        wait_until(|| state.in_flight.load(Ordering::SeqCst) == 1).await;
        for (n, payload) in [&b"A"[..], &b"B"[..], &b"C"[..]].into_iter().enumerate() {
            senders.push(spawn_send(payload));
            wait_until(|| queued(&manager) == n + 1).await;
        }

        for sender in senders {
            assert!(sender.await.unwrap().unwrap().is_none());
        }
        assert_eq!(state.sent.lock().len(), 2);
        assert_eq!(
            state.payloads(),
            vec![b"X".to_vec(), b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]
        );
        assert_eq!(state.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_packet_cut_after_the_message_crossing_recommended_size() {
        // a 10-byte message takes 17 bytes of the packet
        let config = TransportConfig {
            recommended_packet_size: 40,
            ..test_config()
        };
        let (manager, state, _) = setup(config);
        *state.send_delay.lock() = Duration::from_millis(100);

        manager.send(message(vec![0; 10])).await.unwrap();
        wait_until(|| state.in_flight.load(Ordering::SeqCst) == 1).await;
        for n in 1..=5u8 {
            manager.send(message(vec![n; 10])).await.unwrap();
        }

        wait_until(|| state.payloads().len() == 6).await;
        let counts: Vec<usize> = state
            .sent
            .lock()
            .iter()
            .map(|packet| unpack_labelled(packet.clone(), usize::MAX).unwrap().len())
            .collect();
        assert_eq!(counts, vec![1, 3, 2]);
        let order: Vec<u8> = state.payloads().iter().map(|payload| payload[0]).collect();
        assert_eq!(order, (0..6).collect::<Vec<u8>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronous_send_waits_for_the_write() {
        let (manager, state, _) = setup(test_config());
        *state.send_delay.lock() = Duration::from_millis(40);

        let start = Instant::now();
        let reply = manager.send(message(b"sync".to_vec()).synchronous(true)).await.unwrap();
        assert!(reply.is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(state.payloads(), vec![b"sync".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_hands_off_queued_work() {
        let (manager, state, handler) = setup(test_config());
        let mut events = manager.subscribe();

        manager.send(message(b"m0".to_vec()).synchronous(true)).await.unwrap();
        state.refuse.store(true, Ordering::SeqCst);
        state
            .script
            .lock()
            .push_back(SendOutcome::Fail(TransportError::ConnectionClosed("reset".into())));

        manager.send(message(b"m1".to_vec())).await.unwrap();
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Reestablishing { .. })).await;
        manager.send(message(b"m2".to_vec())).await.unwrap();
        manager.send(message(b"m3".to_vec())).await.unwrap();
        assert!(manager.snapshot()[0].reestablishing);

        state.refuse.store(false, Ordering::SeqCst);
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Reestablished { .. })).await;
        wait_until(|| state.payloads().len() == 4).await;

        assert_eq!(
            state.payloads(),
            vec![b"m0".to_vec(), b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec()]
        );
        assert_eq!(state.connects.load(Ordering::SeqCst), 2);
        assert!(handler.failures.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_gives_up_and_disposes_queue() {
        let config = TransportConfig {
            reconnect_max_tries: 3,
            ..test_config()
        };
        let (manager, state, handler) = setup(config);
        let mut events = manager.subscribe();

        manager.send(message(b"m0".to_vec()).synchronous(true)).await.unwrap();
        state.refuse.store(true, Ordering::SeqCst);
        state
            .script
            .lock()
            .push_back(SendOutcome::Fail(TransportError::ConnectionClosed("reset".into())));
        manager.send(message(b"m1".to_vec())).await.unwrap();

        let closed = next_event(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
        assert!(matches!(
            closed,
            ConnectionEvent::Closed {
                reason: TransportError::ReconnectFailed { tries: 3, .. },
                ..
            }
        ));
        wait_until(|| handler.failures.lock().len() == 1).await;
        assert!(manager.snapshot().is_empty());
        assert!(manager.peers().get(PEER).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_overflow_releases_everything_queued() {
        let config = TransportConfig {
            max_queued_items: 3,
            ..test_config()
        };
        let (manager, state, handler) = setup(config);
        *state.send_delay.lock() = Duration::from_secs(5);

        let mut overflow = None;
        let mut accepted = 0;
        for i in 0..10u8 {
            match manager.send(message(vec![i])).await {
                Ok(_) => accepted += 1,
                Err(error) => {
                    overflow = Some(error);
                    break;
                }
            }
        }
        assert!(matches!(overflow, Some(TransportError::QueueOverloaded { .. })));

        let failures = handler.failures.lock().clone();
        assert!(!failures.is_empty());
        assert!(failures.iter().all(|(_, error)| error.contains("overloaded")));
        // everything admitted is either on the wire or reported
        wait_until(|| state.payloads().len() + failures.len() == accepted).await;

        manager.send(message(b"fresh".to_vec())).await.unwrap();
        assert_eq!(state.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_independent_of_the_message_ahead() {
        let (manager, state, _) = setup(test_config());
        *state.send_delay.lock() = Duration::from_secs(10);

        let slow = manager.clone();
        tokio::spawn(async move {
            let long = message(b"long".to_vec())
                .synchronous(true)
                .deadline(Instant::now() + Duration::from_secs(60));
            let _ = slow.send(long).await;
        });
        wait_until(|| state.in_flight.load(Ordering::SeqCst) == 1).await;

        let start = Instant::now();
        let short = message(b"short".to_vec())
            .synchronous(true)
            .deadline(Instant::now() + Duration::from_millis(100));
        assert!(matches!(manager.send(short).await, Err(TransportError::SendTimeout)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_desynchronization_closes_without_reconnecting() {
        let (manager, state, _) = setup(test_config());
        let mut events = manager.subscribe();

        manager.send(message(b"m0".to_vec()).synchronous(true)).await.unwrap();
        state
            .script
            .lock()
            .push_back(SendOutcome::Fail(TransportError::Desynchronization("sequence 4, expected 2".into())));

        let result = manager.send(message(b"m1".to_vec()).synchronous(true)).await;
        assert!(matches!(result, Err(TransportError::Desynchronization(_))));
        let closed = next_event(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
        assert!(matches!(
            closed,
            ConnectionEvent::Closed {
                reason: TransportError::Desynchronization(_),
                ..
            }
        ));
        assert_eq!(state.connects.load(Ordering::SeqCst), 1);

        // a fresh connection may still be opened
        manager.send(message(b"m2".to_vec()).synchronous(true)).await.unwrap();
        assert_eq!(state.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invocation_returns_reply_and_closes() {
        let (manager, state, _) = setup(test_config());
        state.script.lock().push_back(SendOutcome::Reply(labelled(&[&b"pong"[..]])));

        let mut reply = manager
            .invoke(PEER, FramedBuffer::from_bytes(&b"ping"[..]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.to_bytes().unwrap(), Bytes::from_static(b"pong"));
        assert_eq!(state.payloads(), vec![b"ping".to_vec()]);
        wait_until(|| manager.snapshot().is_empty()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_packets_dispatch_in_order() {
        let (manager, _, handler) = setup(test_config());
        let key = ConnectionKey::named(PEER, "bulk");
        let (accepted, feed) = accepted(manager.connector(), key, 1);
        manager.accept(accepted).await.unwrap();

        feed.send(Ok(labelled(&[&b"one"[..], &b"two"[..]]))).unwrap();
        feed.send(Ok(labelled(&[]))).unwrap();
        feed.send(Ok(labelled(&[&b"three"[..]]))).unwrap();

        wait_until(|| handler.received.lock().len() == 3).await;
        let received = handler.received.lock().clone();
        assert_eq!(
            received,
            vec![
                ("bulk".to_string(), b"one".to_vec()),
                ("bulk".to_string(), b"two".to_vec()),
                ("bulk".to_string(), b"three".to_vec()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_inbound_packet_closes_connection() {
        let (manager, _, _) = setup(test_config());
        let mut events = manager.subscribe();
        let (accepted, feed) = accepted(manager.connector(), ConnectionKey::persistent(PEER), 1);
        manager.accept(accepted).await.unwrap();

        feed.send(Ok(Bytes::from_static(b"\x07garbage"))).unwrap();
        let closed = next_event(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
        assert!(matches!(
            closed,
            ConnectionEvent::Closed {
                reason: TransportError::Wire(_),
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_connection_waits_for_peer_to_reconnect() {
        let (manager, state, _) = setup(test_config());
        let mut events = manager.subscribe();
        let key = ConnectionKey::persistent(PEER);

        let (first, feed) = accepted(manager.connector(), key.clone(), 1);
        manager.accept(first).await.unwrap();
        feed.send(Err(TransportError::ConnectionClosed("peer went away".into()))).unwrap();
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Reestablishing { .. })).await;

        manager.send(message(b"queued".to_vec())).await.unwrap();
        assert!(state.payloads().is_empty());

        let (second, _feed) = accepted(manager.connector(), key, 1);
        manager.accept(second).await.unwrap();
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Reestablished { .. })).await;
        wait_until(|| state.payloads() == vec![b"queued".to_vec()]).await;
        assert_eq!(state.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_peer_loses_previous_connections() {
        let (manager, _, _) = setup(test_config());
        let mut events = manager.subscribe();

        let (first, _feed1) = accepted(manager.connector(), ConnectionKey::persistent(PEER), 1);
        manager.accept(first).await.unwrap();
        let (second, _feed2) = accepted(manager.connector(), ConnectionKey::named(PEER, "bulk"), 2);
        manager.accept(second).await.unwrap();

        let closed = next_event(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
        match closed {
            ConnectionEvent::Closed { key, reason } => {
                assert_eq!(key, ConnectionKey::persistent(PEER));
                assert!(matches!(reason, TransportError::PeerRestarted(_)));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(manager.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneous_dial_keeps_the_lower_uri_connection() {
        // local "tcp://local:7000" sorts before the peer's uri
        let (manager, _, _) = setup(test_config());
        manager.send(message(b"m0".to_vec()).synchronous(true)).await.unwrap();

        let (incoming, _feed) = accepted(manager.connector(), ConnectionKey::persistent(PEER), 1);
        assert!(matches!(manager.accept(incoming).await, Err(TransportError::PoolFull(_))));
        assert_eq!(manager.snapshot()[0].origin, Origin::Outbound);

        let (other, _feed) = accepted(manager.connector(), ConnectionKey::persistent("tcp://a-peer:1"), 1);
        manager.accept(other).await.unwrap();
        assert_eq!(manager.snapshot().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_fails_queued_messages() {
        let (manager, state, handler) = setup(test_config());
        *state.send_delay.lock() = Duration::from_secs(5);

        manager.send(message(b"m0".to_vec())).await.unwrap();
        wait_until(|| state.in_flight.load(Ordering::SeqCst) == 1).await;
        manager.send(message(b"m1".to_vec())).await.unwrap();

        assert!(manager.release(&ConnectionKey::persistent(PEER)));
        assert!(!manager.release(&ConnectionKey::persistent(PEER)));
        let failures = handler.failures.lock().clone();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].1.contains("closed manually"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_new_sends() {
        let (manager, _, _) = setup(test_config());
        manager.send(message(b"m0".to_vec()).synchronous(true)).await.unwrap();
        manager.shutdown();
        assert!(manager.snapshot().is_empty());
        assert!(matches!(
            manager.send(message(b"m1".to_vec())).await,
            Err(TransportError::Shutdown)
        ));
    }
}
