//! HTTP server transport.
//!
//! Clients identify their logical connection by the GUID in the request
//! header. `Usual` requests feed the record's inbound stream, `Listening`
//! requests are parked until the record has a packet for the client. The
//! server never dials: a broken connection waits for the client to establish
//! it again under the same GUID, which resumes the sequence counters.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tunnel_wire::{HandshakeMsg, Hello, PacketType, RequestHeader, ResponseHeader, WireError};

use crate::config::TransportConfig;
use crate::error::{ErrorClass, Result, TransportError};
use crate::manager::{ConnectionManager, Record};
use crate::message::ConnectionKey;
use crate::record::Sequences;
use crate::security::{session_pair, HandshakeDriver};
use crate::transport::http_client::{pack_parts, unpack_parts, EstablishStep, OCTET_STREAM, SENDER_PAIRING};
use crate::transport::{Accepted, Channel, ConnectRequest, Connector, Established};

type Registry = DashMap<Uuid, Arc<HttpServerChannel>>;

/// Response packet type, sequence and body
type Reply = (PacketType, i32, Bytes);

struct ParkedPoll {
    id: u64,
    sequence: i32,
    reply: oneshot::Sender<Bytes>,
}

#[derive(Default)]
struct Outbound {
    poll: Option<ParkedPoll>,
    /// Last packet handed to a poll, for a client repeating that poll
    cached: Option<(i32, Bytes)>,
    next_poll_id: u64,
}

enum PollOutcome {
    Packet(Bytes),
    TimedOut,
    Closed,
    Desynchronized(String),
}

/// Server side of an HTTP virtual connection
pub struct HttpServerChannel {
    wire_id: Uuid,
    key: ConnectionKey,
    sequences: Arc<Sequences>,
    inbound_tx: mpsc::UnboundedSender<Result<Bytes>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Bytes>>>,
    outbound: Mutex<Outbound>,
    poll_arrived: Notify,
    closed: watch::Sender<bool>,
    /// When and whether recoverably the channel was closed
    closed_at: Mutex<Option<(Instant, bool)>>,
    registry: Weak<Registry>,
}

impl HttpServerChannel {
    fn new(wire_id: Uuid, key: ConnectionKey, sequences: Arc<Sequences>, cached: Option<(i32, Bytes)>, registry: Weak<Registry>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            wire_id,
            key,
            sequences,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound: Mutex::new(Outbound {
                cached,
                ..Outbound::default()
            }),
            poll_arrived: Notify::new(),
            closed: watch::channel(false).0,
            closed_at: Mutex::new(None),
            registry,
        }
    }

    /// GUID the client chose for this connection
    pub fn wire_id(&self) -> Uuid {
        self.wire_id
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn closed_error(&self) -> TransportError {
        TransportError::ConnectionClosed(format!("{} closed", self.key))
    }

    /// Packet type telling the client this channel is closed; a recoverable
    /// closure makes the client reestablish
    fn closed_response(&self) -> PacketType {
        match *self.closed_at.lock() {
            Some((_, true)) => PacketType::PoolFull,
            _ => PacketType::ClosedManually,
        }
    }

    fn closed_longer_than(&self, now: Instant, limit: Duration) -> bool {
        self.closed_at
            .lock()
            .is_some_and(|(at, _)| now.saturating_duration_since(at) >= limit)
    }

    fn cached(&self) -> Option<(i32, Bytes)> {
        self.outbound.lock().cached.clone()
    }

    /// Check an inbound sequence number: `Ok(true)` for the expected packet,
    /// `Ok(false)` for a repeat of the previous one
    fn admit(&self, sequence: i32) -> Result<bool> {
        let expected = self.sequences.recv();
        if sequence == expected {
            self.sequences.advance_recv();
            Ok(true)
        } else if sequence == expected.wrapping_sub(1) {
            Ok(false)
        } else {
            Err(TransportError::Desynchronization(format!(
                "expected packet {expected}, got {sequence}"
            )))
        }
    }

    fn deliver(&self, packet: Result<Bytes>) {
        // the receiver lives as long as the channel
        let _ = self.inbound_tx.send(packet);
    }

    async fn poll(&self, sequence: i32, wait: Duration) -> PollOutcome {
        let (id, mut rx) = {
            let mut outbound = self.outbound.lock();
            if let Some((cached, packet)) = &outbound.cached {
                if *cached == sequence {
                    return PollOutcome::Packet(packet.clone());
                }
            }
            if self.is_closed() {
                return PollOutcome::Closed;
            }
            let expected = self.sequences.send();
            if sequence != expected {
                return PollOutcome::Desynchronized(format!("expected listener poll {expected}, got {sequence}"));
            }
            let (reply, rx) = oneshot::channel();
            outbound.next_poll_id += 1;
            let id = outbound.next_poll_id;
            // a newer poll supersedes one the client gave up on
            outbound.poll = Some(ParkedPoll { id, sequence, reply });
            (id, rx)
        };
        self.poll_arrived.notify_one();

        match timeout(wait, &mut rx).await {
            Ok(Ok(packet)) => PollOutcome::Packet(packet),
            Ok(Err(_)) if self.is_closed() => PollOutcome::Closed,
            Ok(Err(_)) => PollOutcome::TimedOut,
            Err(_) => {
                {
                    let mut outbound = self.outbound.lock();
                    if outbound.poll.as_ref().is_some_and(|poll| poll.id == id) {
                        outbound.poll = None;
                        return PollOutcome::TimedOut;
                    }
                }
                // a packet was handed over while the timer fired
                match rx.try_recv() {
                    Ok(packet) => PollOutcome::Packet(packet),
                    Err(_) => PollOutcome::TimedOut,
                }
            }
        }
    }
}

#[async_trait]
impl Channel for HttpServerChannel {
    async fn send_packet(&self, packet: Bytes, _expect_reply: bool) -> Result<Option<Bytes>> {
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow_and_update() {
                return Err(self.closed_error());
            }
            {
                let mut outbound = self.outbound.lock();
                if let Some(poll) = outbound.poll.take() {
                    let sequence = poll.sequence;
                    if poll.reply.send(packet.clone()).is_ok() {
                        outbound.cached = Some((sequence, packet));
                        self.sequences.advance_send();
                        return Ok(None);
                    }
                }
            }
            tokio::select! {
                _ = self.poll_arrived.notified() => {}
                _ = closed.changed() => {}
            }
        }
    }

    async fn recv_packet(&self) -> Result<Option<Bytes>> {
        let mut closed = self.closed.subscribe();
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            packet = inbound.recv() => match packet {
                Some(packet) => packet.map(Some),
                None => Err(self.closed_error()),
            },
            _ = closed.wait_for(|closed| *closed) => Err(self.closed_error()),
        }
    }

    fn close(&self, reason: &TransportError) {
        if self.closed.send_replace(true) {
            return;
        }
        let recoverable = reason.is_recoverable();
        *self.closed_at.lock() = Some((Instant::now(), recoverable));
        self.outbound.lock().poll = None;
        debug!(connection = %self.key, wire_id = %self.wire_id, %reason, "http connection closed");

        // a recoverable closure stays known so the client can resume it
        if !recoverable {
            if let Some(registry) = self.registry.upgrade() {
                registry.remove_if(&self.wire_id, |_, channel| std::ptr::eq(channel.as_ref(), self));
            }
        }
    }
}

impl std::fmt::Debug for HttpServerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerChannel")
            .field("wire_id", &self.wire_id)
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Establishment in progress
struct Pending {
    remote: Hello,
    version: u8,
    key: ConnectionKey,
    reset: bool,
    client_seq: i32,
    listen_seq: i32,
    /// Client sender path against our listener path
    listener: HandshakeDriver,
    /// Our sender path against the client listener path
    sender: HandshakeDriver,
    sender_started: bool,
    created: Instant,
}

/// Server-side connector: tracks client connections by GUID, never dials
#[derive(Default)]
pub struct HttpServerConnector {
    channels: Arc<Registry>,
    pending: DashMap<Uuid, Arc<Mutex<Pending>>>,
}

impl HttpServerConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of client connections known, closed ones awaiting resumption
    /// included
    pub fn known_connections(&self) -> usize {
        self.channels.len()
    }

    fn channel(&self, wire_id: &Uuid) -> Option<Arc<HttpServerChannel>> {
        self.channels.get(wire_id).map(|entry| entry.value().clone())
    }

    /// Forget stale establishments and closed connections nobody resumed
    fn prune(&self, now: Instant, config: &TransportConfig) {
        self.pending
            .retain(|_, pending| now.saturating_duration_since(pending.lock().created) < config.connect_timeout);
        self.channels
            .retain(|_, channel| !channel.closed_longer_than(now, config.reconnect_deadline));
    }
}

impl std::fmt::Debug for HttpServerConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerConnector")
            .field("channels", &self.channels.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[async_trait]
impl Connector for HttpServerConnector {
    type Channel = HttpServerChannel;

    async fn connect(&self, request: ConnectRequest) -> Result<Established<HttpServerChannel>> {
        Err(TransportError::Config(format!(
            "an http server cannot dial {}",
            request.peer.uri()
        )))
    }

    fn can_dial(&self) -> bool {
        false
    }
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = code;
    response
}

impl ConnectionManager<HttpServerConnector> {
    /// Bind `addr` and serve the transport path until shutdown. Returns the
    /// bound address.
    pub async fn serve(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        info!(addr = %bound, path = %self.inner.config.http_path, "http server started");

        let this = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let (stream, remote) = tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(error) => {
                            warn!(%error, "accept failed");
                            continue;
                        }
                    },
                };
                let this = this.clone();
                tokio::spawn(async move {
                    let mut builder = http1::Builder::new();
                    builder.keep_alive(this.inner.config.http_keep_alive);
                    let service = service_fn(move |request| {
                        let this = this.clone();
                        async move { Ok::<_, Infallible>(this.handle(request).await) }
                    });
                    if let Err(error) = builder.serve_connection(TokioIo::new(stream), service).await {
                        debug!(%remote, %error, "http connection ended");
                    }
                });
            }
            info!(addr = %bound, "http server stopped");
        });
        Ok(bound)
    }

    async fn handle(&self, request: Request<Incoming>) -> Response<Full<Bytes>> {
        if request.method() != Method::POST {
            return status(StatusCode::METHOD_NOT_ALLOWED);
        }
        if request.uri().path() != self.inner.config.http_path {
            return status(StatusCode::NOT_FOUND);
        }
        let body = match request.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(error) => {
                debug!(%error, "request body unreadable");
                return status(StatusCode::BAD_REQUEST);
            }
        };
        match self.process(body).await {
            Ok(body) => {
                let mut response = Response::new(Full::new(body));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
                response
            }
            Err(error) => {
                warn!(%error, "malformed request header");
                status(StatusCode::BAD_REQUEST)
            }
        }
    }

    /// Serve one request body; the result is the response body
    pub(crate) async fn process(&self, mut body: Bytes) -> std::result::Result<Bytes, WireError> {
        let header = RequestHeader::decode(&mut body)?;
        let (packet_type, sequence, payload) = match header.packet_type {
            PacketType::Establishing | PacketType::EstablishingResetConnection => self.on_establish(&header, body).await,
            PacketType::Usual => self.on_usual(&header, body).await,
            PacketType::Listening => self.on_listen(&header).await,
            PacketType::ClosedManually => self.on_close(&header),
            other => {
                warn!(peer_id = %header.peer_id, ?other, "unexpected request type");
                (PacketType::Desynchronization, header.sequence, Bytes::new())
            }
        };

        let response = ResponseHeader {
            server_uri: self.inner.local.uri.clone(),
            sequence,
            packet_type,
            host_id: self.inner.local.host_id,
        };
        let mut buf = BytesMut::with_capacity(64 + payload.len());
        response.encode(header.version, &mut buf);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    fn record_of(&self, channel: &Arc<HttpServerChannel>) -> Option<Arc<Record<HttpServerConnector>>> {
        self.inner
            .pool
            .get(&channel.key)
            .map(|entry| entry.value().clone())
            .filter(|record| record.channel().is_some_and(|current| Arc::ptr_eq(current, channel)))
    }

    async fn on_establish(&self, header: &RequestHeader, body: Bytes) -> Reply {
        match self.establish_step(header, body).await {
            Ok(reply) => reply,
            Err(error) => {
                warn!(peer_id = %header.peer_id, %error, "establishment failed");
                self.inner.connector.pending.remove(&header.peer_id);
                let packet_type = match error.class() {
                    _ if matches!(error, TransportError::PoolFull(_)) => PacketType::PoolFull,
                    ErrorClass::Desynchronization => PacketType::Desynchronization,
                    _ => PacketType::SenderError,
                };
                (packet_type, header.sequence, Bytes::new())
            }
        }
    }

    async fn establish_step(&self, header: &RequestHeader, body: Bytes) -> Result<Reply> {
        let config = self.inner.config.clone();
        let connector = &self.inner.connector;
        let parts = unpack_parts(body, config.max_message_size)?;
        let (hello, step) = match parts.as_slice() {
            [step] => (None, EstablishStep::decode(step.clone())?),
            [hello, step] => (Some(Hello::decode(hello.clone())?), EstablishStep::decode(step.clone())?),
            _ => return Err(WireError::Malformed.into()),
        };

        let first = hello.is_some();
        if let Some(remote) = hello {
            connector.prune(Instant::now(), &config);
            let (factory, name) = self.security();
            let (sender, listener) = session_pair(factory, name)?;
            debug!(peer = %remote.uri, peer_id = %header.peer_id, reset = header.packet_type == PacketType::EstablishingResetConnection, "establishment started");
            let pending = Pending {
                key: ConnectionKey::new(remote.uri.clone(), header.connection_name.clone(), header.kind),
                remote,
                version: header.version,
                reset: header.packet_type == PacketType::EstablishingResetConnection,
                client_seq: header.sequence,
                listen_seq: step.listen_seq,
                listener: HandshakeDriver::new(listener),
                sender: HandshakeDriver::new(sender),
                sender_started: false,
                created: Instant::now(),
            };
            connector.pending.insert(header.peer_id, Arc::new(Mutex::new(pending)));
        }
        let pending = connector
            .pending
            .get(&header.peer_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Desynchronization(format!("no establishment in progress for {}", header.peer_id)))?;

        let (answer, complete) = {
            let mut state = pending.lock();
            let answer = match step.pairing {
                SENDER_PAIRING => state.listener.respond(step.msg)?,
                _ if !state.sender_started => {
                    state.sender_started = true;
                    Some(state.sender.start()?)
                }
                _ => state.sender.respond(step.msg)?,
            };
            let complete = state.sender_started && state.listener.is_complete() && state.sender.is_complete();
            let answer = answer.unwrap_or(HandshakeMsg {
                done: true,
                token: None,
            });
            (answer, complete)
        };

        let mut parts = Vec::with_capacity(2);
        if first {
            parts.push(self.inner.local.hello().encode());
        }
        parts.push(answer.encode());
        let reply = (header.packet_type, header.sequence, pack_parts(&parts, config.chunk_size));

        if complete {
            connector
                .pending
                .remove_if(&header.peer_id, |_, current| Arc::ptr_eq(current, &pending));
            let pending = Arc::try_unwrap(pending)
                .map_err(|_| TransportError::Security("establishment used concurrently".into()))?
                .into_inner();
            self.complete_establishment(header.peer_id, pending).await?;
        }
        Ok(reply)
    }

    async fn complete_establishment(&self, wire_id: Uuid, pending: Pending) -> Result<()> {
        let connector = &self.inner.connector;
        let Pending {
            remote,
            version,
            key,
            reset,
            client_seq,
            listen_seq,
            listener,
            sender,
            ..
        } = pending;

        let previous = connector.channel(&wire_id);
        let (sequences, cached) = match previous {
            Some(previous) if !reset => (previous.sequences.clone(), previous.cached()),
            _ if reset => (Arc::new(Sequences::new()), None),
            _ => {
                // unknown to us, resume from the client's counters
                let sequences = Sequences::new();
                sequences.set(listen_seq, client_seq);
                (Arc::new(sequences), None)
            }
        };

        let channel = Arc::new(HttpServerChannel::new(
            wire_id,
            key.clone(),
            sequences.clone(),
            cached,
            Arc::downgrade(&connector.channels),
        ));
        let record = self
            .accept(Accepted {
                key,
                remote,
                version,
                wire_id,
                channel: channel.clone(),
                sequences,
                sender_session: sender.finish()?,
                listener_session: listener.finish()?,
            })
            .await?;
        debug!(connection = %record.key(), record = record.id(), %wire_id, "http connection registered");

        if let Some(old) = connector.channels.insert(wire_id, channel.clone()) {
            if !Arc::ptr_eq(&old, &channel) {
                old.close(&TransportError::ClosedManually);
            }
        }
        Ok(())
    }

    async fn on_usual(&self, header: &RequestHeader, body: Bytes) -> Reply {
        let sequence = header.sequence;
        let Some(channel) = self.inner.connector.channel(&header.peer_id) else {
            debug!(peer_id = %header.peer_id, "packet for an unknown connection");
            return (PacketType::Desynchronization, sequence, Bytes::new());
        };
        if channel.is_closed() {
            return (channel.closed_response(), sequence, Bytes::new());
        }

        match channel.admit(sequence) {
            Ok(true) => {}
            Ok(false) => {
                debug!(connection = %channel.key, sequence, "repeated packet acknowledged");
                return (PacketType::Usual, sequence, Bytes::new());
            }
            Err(error) => {
                warn!(connection = %channel.key, %error, "sender out of sequence");
                self.desynchronized(&channel, error);
                return (PacketType::Desynchronization, sequence, Bytes::new());
            }
        }

        if header.kind.is_long_lived() {
            channel.deliver(Ok(body));
            return (PacketType::Usual, sequence, Bytes::new());
        }

        let Some(record) = self.record_of(&channel) else {
            return (PacketType::ClosedManually, sequence, Bytes::new());
        };
        let exchange = self.handle_exchange(&record, body).await;
        self.close_record(&record, TransportError::ClosedManually);
        match exchange {
            Ok(reply) => (PacketType::Usual, sequence, reply.unwrap_or_default()),
            Err(error) => {
                warn!(connection = %record.key(), %error, "exchange failed");
                (PacketType::SenderError, sequence, Bytes::new())
            }
        }
    }

    async fn on_listen(&self, header: &RequestHeader) -> Reply {
        let sequence = header.sequence;
        let Some(channel) = self.inner.connector.channel(&header.peer_id) else {
            debug!(peer_id = %header.peer_id, "poll for an unknown connection");
            return (PacketType::Desynchronization, sequence, Bytes::new());
        };
        match channel.poll(sequence, self.inner.config.listener_timeout).await {
            PollOutcome::Packet(packet) => (PacketType::Usual, sequence, packet),
            PollOutcome::TimedOut => (PacketType::ListenerTimedOut, sequence, Bytes::new()),
            PollOutcome::Closed => (channel.closed_response(), sequence, Bytes::new()),
            PollOutcome::Desynchronized(reason) => {
                warn!(connection = %channel.key, %reason, "listener out of sequence");
                self.desynchronized(&channel, TransportError::Desynchronization(reason));
                (PacketType::Desynchronization, sequence, Bytes::new())
            }
        }
    }

    fn on_close(&self, header: &RequestHeader) -> Reply {
        if let Some(channel) = self.inner.connector.channel(&header.peer_id) {
            info!(connection = %channel.key, "client closed the connection");
            match self.record_of(&channel) {
                Some(record) => self.close_record(&record, TransportError::ClosedManually),
                None => channel.close(&TransportError::ClosedManually),
            }
        }
        (PacketType::ClosedManually, header.sequence, Bytes::new())
    }

    fn desynchronized(&self, channel: &Arc<HttpServerChannel>, error: TransportError) {
        if channel.key.kind.is_long_lived() {
            // the receive loop routes it like any other failure
            channel.deliver(Err(error));
        } else if let Some(record) = self.record_of(channel) {
            self.close_record(&record, error);
        } else {
            channel.close(&error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::{next_event, test_config, wait_until, CollectingHandler};
    use crate::manager::ConnectionEvent;
    use crate::message::Message;
    use crate::security::NoSecurityFactory;
    use crate::transport::http_client::HttpClientConnector;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use tunnel_wire::{ConnectionKind, FramedBuffer, LabelledWriter, WIRE_VERSION};

    const CLIENT: &str = "http://client:9000";

    fn config() -> TransportConfig {
        TransportConfig {
            listener_timeout: Duration::from_millis(500),
            ..test_config()
        }
    }

    struct Setup {
        server: ConnectionManager<HttpServerConnector>,
        server_handler: Arc<CollectingHandler>,
        client: ConnectionManager<HttpClientConnector>,
        client_handler: Arc<CollectingHandler>,
        uri: String,
    }

    async fn setup() -> Setup {
        let config = config();
        let server_handler = Arc::new(CollectingHandler::default());
        let server = ConnectionManager::new(config.clone(), "http://server:0", HttpServerConnector::new(), server_handler.clone(), Arc::new(NoSecurityFactory)).unwrap();
        let bound = server.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let client_handler = Arc::new(CollectingHandler::default());
        let client = ConnectionManager::new(config.clone(), CLIENT, HttpClientConnector::new(&config), client_handler.clone(), Arc::new(NoSecurityFactory)).unwrap();
        Setup {
            server,
            server_handler,
            client,
            client_handler,
            uri: format!("http://{bound}"),
        }
    }

    fn request(wire_id: Uuid, packet_type: PacketType, sequence: i32, payload: &[u8]) -> Bytes {
        let header = RequestHeader {
            version: WIRE_VERSION,
            kind: ConnectionKind::Persistent,
            peer_id: wire_id,
            packet_type,
            sequence,
            connection_name: "default".into(),
            host_id: 1,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }

    fn response_type(mut body: Bytes) -> PacketType {
        ResponseHeader::decode(&mut body, WIRE_VERSION).unwrap().packet_type
    }

    fn labelled(payload: &[u8]) -> Bytes {
        let mut writer = LabelledWriter::new(1024);
        writer.push_bytes(payload);
        writer.finish()
    }

    async fn connected(setup: &Setup) -> Uuid {
        setup
            .client
            .send(Message::new(ConnectionKey::persistent(&setup.uri), FramedBuffer::from_bytes(&b"first"[..])).synchronous(true))
            .await
            .unwrap();
        wait_until(|| setup.server_handler.received.lock().len() == 1).await;
        let channels = &setup.server.connector().channels;
        assert_eq!(channels.len(), 1);
        let wire_id = *channels.iter().next().unwrap().key();
        wire_id
    }

    #[tokio::test]
    async fn test_persistent_connection_carries_both_directions() {
        let setup = setup().await;
        connected(&setup).await;
        assert_eq!(setup.server_handler.received.lock()[0].1, b"first".to_vec());

        // delivered through the client's listener poll
        setup
            .server
            .send(Message::new(ConnectionKey::persistent(CLIENT), FramedBuffer::from_bytes(&b"back"[..])).synchronous(true))
            .await
            .unwrap();
        wait_until(|| setup.client_handler.received.lock().len() == 1).await;
        assert_eq!(setup.client_handler.received.lock()[0].1, b"back".to_vec());

        setup.client.shutdown();
        setup.server.shutdown();
    }

    #[tokio::test]
    async fn test_invocation_reply_in_response_body() {
        let setup = setup().await;
        *setup.server_handler.reply.lock() = Some(b"pong".to_vec());

        let mut reply = setup
            .client
            .invoke(&setup.uri, FramedBuffer::from_bytes(&b"ping"[..]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply.to_bytes().unwrap()[..], b"pong");
        wait_until(|| setup.server.snapshot().is_empty() && setup.server.connector().known_connections() == 0).await;
    }

    #[tokio::test]
    async fn test_repeated_packet_is_acknowledged_once() {
        let setup = setup().await;
        let wire_id = connected(&setup).await;

        // the first packet went out with sequence 0
        let body = setup
            .server
            .process(request(wire_id, PacketType::Usual, 0, &labelled(b"first")))
            .await
            .unwrap();
        assert_eq!(response_type(body), PacketType::Usual);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(setup.server_handler.received.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_sequence_packet_desynchronizes() {
        let setup = setup().await;
        let wire_id = connected(&setup).await;

        let body = setup
            .server
            .process(request(wire_id, PacketType::Usual, 7, &labelled(b"late")))
            .await
            .unwrap();
        assert_eq!(response_type(body), PacketType::Desynchronization);
        wait_until(|| setup.server.snapshot().is_empty()).await;
        assert_eq!(setup.server.connector().known_connections(), 0);
    }

    #[tokio::test]
    async fn test_unknown_connection_is_desynchronization() {
        let setup = setup().await;
        let body = setup
            .server
            .process(request(Uuid::new_v4(), PacketType::Usual, 0, &labelled(b"x")))
            .await
            .unwrap();
        assert_eq!(response_type(body), PacketType::Desynchronization);

        let body = setup
            .server
            .process(request(Uuid::new_v4(), PacketType::Listening, 0, &[]))
            .await
            .unwrap();
        assert_eq!(response_type(body), PacketType::Desynchronization);
    }

    #[tokio::test]
    async fn test_client_close_releases_server_record() {
        let setup = setup().await;
        connected(&setup).await;
        assert!(setup.client.release(&ConnectionKey::persistent(&setup.uri)));
        wait_until(|| setup.server.snapshot().is_empty()).await;
    }

    #[tokio::test]
    async fn test_failed_connection_resumes_under_the_same_guid() {
        let setup = setup().await;
        let wire_id = connected(&setup).await;
        let key = ConnectionKey::persistent(&setup.uri);
        let mut events = setup.client.subscribe();

        let record = setup.client.inner.pool.get(&key).unwrap().value().clone();
        setup
            .client
            .on_failure(&record, TransportError::ConnectionClosed("reset".into()));
        let event = next_event(&mut events, |e| matches!(e, ConnectionEvent::Reestablishing { .. })).await;
        assert!(matches!(
            event,
            ConnectionEvent::Reestablishing {
                cause: TransportError::ConnectionClosed(_),
                ..
            }
        ));

        // queued while reestablishing, sent with the resumed sequence
        setup
            .client
            .send(Message::new(key.clone(), FramedBuffer::from_bytes(&b"second"[..])).synchronous(true))
            .await
            .unwrap();
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Reestablished { .. })).await;
        wait_until(|| setup.server_handler.received.lock().len() == 2).await;

        let received: Vec<Vec<u8>> = setup.server_handler.received.lock().iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(received, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(setup.server.snapshot().len(), 1);
        assert_eq!(setup.server.connector().known_connections(), 1);
        assert!(setup.server.connector().channel(&wire_id).is_some());

        // the listener poll survives its server-side timeout
        tokio::time::sleep(config().listener_timeout + Duration::from_millis(200)).await;
        setup
            .server
            .send(Message::new(ConnectionKey::persistent(CLIENT), FramedBuffer::from_bytes(&b"back"[..])).synchronous(true))
            .await
            .unwrap();
        wait_until(|| setup.client_handler.received.lock().len() == 1).await;
        assert_eq!(setup.client_handler.received.lock()[0].1, b"back".to_vec());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(setup.server_handler.received.lock().len(), 2);

        setup.client.shutdown();
        setup.server.shutdown();
    }

    #[tokio::test]
    async fn test_rejects_non_post() {
        let setup = setup().await;
        let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
        let uri: hyper::Uri = format!("{}/tunnel", setup.uri).parse().unwrap();
        let response = client.get(uri).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
