//! HTTP client transport: a virtual duplex socket made of POST requests.
//!
//! Outbound packets travel as `Usual` request bodies, acknowledged by an
//! empty response with the same sequence number. Inbound packets are fetched
//! by `Listening` long polls that the server parks until it has something to
//! send or its listener timeout fires. Establishment runs both security
//! pairings over `Establishing` requests; the first one also carries the
//! client [`Hello`] and is answered with the server's.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, trace};
use uuid::Uuid;

use tunnel_wire::{
    unpack_labelled, HandshakeMsg, Hello, LabelledWriter, PacketType, RequestHeader, ResponseHeader, WireError,
    WIRE_VERSION,
};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::message::ConnectionKey;
use crate::record::Sequences;
use crate::security::{session_pair, HandshakeDriver};
use crate::transport::{Channel, ConnectRequest, Connector, Established};

/// Content type of every request and response
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Slack on top of the listener timeout before a poll is abandoned locally
pub const LISTEN_GRACE: Duration = Duration::from_secs(5);

/// Pairing of the client sender path with the server listener path
pub(crate) const SENDER_PAIRING: u8 = 0;
/// Pairing of the server sender path with the client listener path
pub(crate) const LISTENER_PAIRING: u8 = 1;

/// One handshake step of an establishing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EstablishStep {
    pub(crate) pairing: u8,
    /// Next listener sequence the client expects
    pub(crate) listen_seq: i32,
    pub(crate) msg: HandshakeMsg,
}

impl EstablishStep {
    pub(crate) fn encode(&self) -> Bytes {
        let msg = self.msg.encode();
        let mut buf = BytesMut::with_capacity(5 + msg.len());
        buf.put_u8(self.pairing);
        buf.put_i32(self.listen_seq);
        buf.put_slice(&msg);
        buf.freeze()
    }

    pub(crate) fn decode(mut buf: Bytes) -> std::result::Result<Self, WireError> {
        if buf.len() < 5 {
            return Err(WireError::Incomplete);
        }
        let pairing = buf.get_u8();
        if pairing > LISTENER_PAIRING {
            return Err(WireError::Flag(pairing));
        }
        let listen_seq = buf.get_i32();
        Ok(Self {
            pairing,
            listen_seq,
            msg: HandshakeMsg::decode(buf)?,
        })
    }
}

/// Labelled body made of whole parts
pub(crate) fn pack_parts(parts: &[Bytes], chunk_size: usize) -> Bytes {
    let mut writer = LabelledWriter::new(chunk_size);
    for part in parts {
        writer.push_bytes(part);
    }
    writer.finish()
}

/// Parts of a labelled body
pub(crate) fn unpack_parts(body: Bytes, max_message_size: usize) -> std::result::Result<Vec<Bytes>, WireError> {
    unpack_labelled(body, max_message_size)?
        .into_iter()
        .map(|mut part| part.to_bytes())
        .collect()
}

/// Endpoint URL of a peer; a peer URI without a path gets `path`
fn endpoint(uri: &str, path: &str) -> Result<Uri> {
    let parsed: Uri = uri
        .parse()
        .map_err(|err| TransportError::Config(format!("{uri:?} is not an http uri: {err}")))?;
    if parsed.scheme_str() != Some("http") {
        return Err(TransportError::Config(format!("{uri:?} is not an http:// uri")));
    }
    if !matches!(parsed.path(), "" | "/") {
        return Ok(parsed);
    }
    format!("{}{path}", uri.trim_end_matches('/'))
        .parse()
        .map_err(|err| TransportError::Config(format!("{uri:?}: {err}")))
}

/// Error for a response whose packet type is not the one expected
fn refusal(packet_type: PacketType, peer: &str) -> TransportError {
    match packet_type {
        PacketType::Desynchronization => TransportError::Desynchronization(format!("{peer} reported desynchronization")),
        PacketType::ClosedManually => TransportError::ClosedManually,
        PacketType::SenderError => TransportError::SenderError,
        PacketType::PoolFull => TransportError::PoolFull(peer.to_string()),
        other => TransportError::Desynchronization(format!("unexpected {other:?} response from {peer}")),
    }
}

/// Request factory of one logical connection
#[derive(Clone)]
struct HttpExchange {
    client: Client<HttpConnector, Full<Bytes>>,
    endpoint: Uri,
    peer: String,
    key: ConnectionKey,
    wire_id: Uuid,
    host_id: i32,
}

impl HttpExchange {
    async fn post(&self, packet_type: PacketType, sequence: i32, body: &[u8]) -> Result<(ResponseHeader, Bytes)> {
        let header = RequestHeader {
            version: WIRE_VERSION,
            kind: self.key.kind,
            peer_id: self.wire_id,
            packet_type,
            sequence,
            connection_name: self.key.name.clone(),
            host_id: self.host_id,
        };
        let mut buf = BytesMut::with_capacity(header.encoded_len() + body.len());
        header.encode(&mut buf);
        buf.put_slice(body);

        let mut request = Request::new(Full::new(buf.freeze()));
        *request.method_mut() = Method::POST;
        *request.uri_mut() = self.endpoint.clone();
        request.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));

        trace!(connection = %self.key, ?packet_type, sequence, len = body.len(), "http request");
        let response = self.client.request(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!("{} answered {status}", self.peer)));
        }
        let mut body = response.into_body().collect().await?.to_bytes();
        let header = ResponseHeader::decode(&mut body, WIRE_VERSION)?;
        Ok((header, body))
    }
}

/// Client side of an HTTP virtual connection
pub struct HttpClientChannel {
    exchange: HttpExchange,
    sequences: Arc<Sequences>,
    listener_timeout: Duration,
    closed: AtomicBool,
    remote_closed: AtomicBool,
}

impl HttpClientChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed(format!("{} closed", self.exchange.key)));
        }
        Ok(())
    }

    fn refused(&self, packet_type: PacketType) -> TransportError {
        if packet_type == PacketType::ClosedManually {
            self.remote_closed.store(true, Ordering::Release);
        }
        refusal(packet_type, &self.exchange.peer)
    }
}

#[async_trait]
impl Channel for HttpClientChannel {
    async fn send_packet(&self, packet: Bytes, expect_reply: bool) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let sequence = self.sequences.send();
        let (header, body) = self.exchange.post(PacketType::Usual, sequence, &packet).await?;
        if header.packet_type != PacketType::Usual {
            return Err(self.refused(header.packet_type));
        }
        if header.sequence != sequence {
            return Err(TransportError::Desynchronization(format!(
                "sent packet {sequence}, server acknowledged {}",
                header.sequence
            )));
        }
        self.sequences.advance_send();
        Ok(expect_reply.then_some(body))
    }

    async fn recv_packet(&self) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let sequence = self.sequences.recv();
        let poll = self.exchange.post(PacketType::Listening, sequence, &[]);
        let (header, body) = match timeout(self.listener_timeout + LISTEN_GRACE, poll).await {
            Ok(response) => response?,
            Err(_) => {
                debug!(connection = %self.exchange.key, sequence, "listener poll timed out, polling again");
                return Ok(None);
            }
        };
        match header.packet_type {
            PacketType::ListenerTimedOut => Ok(None),
            PacketType::Usual if header.sequence == sequence => {
                self.sequences.advance_recv();
                Ok(Some(body))
            }
            PacketType::Usual => Err(TransportError::Desynchronization(format!(
                "expected listener packet {sequence}, got {}",
                header.sequence
            ))),
            other => Err(self.refused(other)),
        }
    }

    fn close(&self, reason: &TransportError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // a recoverable failure keeps the server side for the reconnection
        if !self.exchange.key.kind.is_long_lived() || reason.is_recoverable() || self.remote_closed.load(Ordering::Acquire) {
            return;
        }
        let exchange = self.exchange.clone();
        let sequence = self.sequences.send();
        tokio::spawn(async move {
            let notice = exchange.post(PacketType::ClosedManually, sequence, &[]);
            match timeout(LISTEN_GRACE, notice).await {
                Ok(Ok(_)) => debug!(connection = %exchange.key, "server notified of close"),
                Ok(Err(error)) => debug!(connection = %exchange.key, %error, "close notice failed"),
                Err(_) => debug!(connection = %exchange.key, "close notice timed out"),
            }
        });
    }
}

impl std::fmt::Debug for HttpClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientChannel")
            .field("endpoint", &self.exchange.endpoint)
            .field("wire_id", &self.exchange.wire_id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Opens HTTP virtual connections to `http://host:port[/path]` peers
#[derive(Clone)]
pub struct HttpClientConnector {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpClientConnector {
    /// Create a connector; without keep-alive every request uses a fresh
    /// TCP connection
    pub fn new(config: &TransportConfig) -> Self {
        let mut builder = Client::builder(TokioExecutor::new());
        if !config.http_keep_alive {
            builder.pool_max_idle_per_host(0);
        }
        Self {
            client: builder.build_http(),
        }
    }

    /// Send one establishing step; the first step carries `hello`
    async fn step(
        &self,
        exchange: &HttpExchange,
        packet_type: PacketType,
        request: &ConnectRequest,
        hello: Option<&Hello>,
        step: EstablishStep,
    ) -> Result<(Option<Hello>, HandshakeMsg)> {
        let config = &request.config;
        let mut parts = Vec::with_capacity(2);
        if let Some(hello) = hello {
            parts.push(hello.encode());
        }
        parts.push(step.encode());

        let body = pack_parts(&parts, config.chunk_size);
        let (header, body) = exchange.post(packet_type, request.sequences.send(), &body).await?;
        if header.packet_type != packet_type {
            return Err(refusal(header.packet_type, &exchange.peer));
        }

        let mut parts = unpack_parts(body, config.max_message_size)?.into_iter();
        let remote = match hello {
            Some(_) => {
                let raw = parts.next().ok_or(WireError::Malformed)?;
                Some(Hello::decode(raw)?)
            }
            None => None,
        };
        let raw = parts.next().ok_or(WireError::Malformed)?;
        Ok((remote, HandshakeMsg::decode(raw)?))
    }
}

impl std::fmt::Debug for HttpClientConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for HttpClientConnector {
    type Channel = HttpClientChannel;

    async fn connect(&self, request: ConnectRequest) -> Result<Established<HttpClientChannel>> {
        let config = &request.config;
        let exchange = HttpExchange {
            client: self.client.clone(),
            endpoint: endpoint(request.peer.uri(), &config.http_path)?,
            peer: request.peer.uri().to_string(),
            key: request.key.clone(),
            wire_id: request.wire_id,
            host_id: request.local.host_id,
        };
        if request.reset {
            request.sequences.reset();
        }
        let packet_type = if request.reset {
            PacketType::EstablishingResetConnection
        } else {
            PacketType::Establishing
        };
        debug!(connection = %request.key, endpoint = %exchange.endpoint, reset = request.reset, "establishing http connection");

        let (sender, listener) = session_pair(&request.security, config.security_session.as_deref())?;
        let mut sender = HandshakeDriver::new(sender);
        let mut listener = HandshakeDriver::new(listener);
        let hello = request.local.hello();
        let listen_seq = request.sequences.recv();

        // our sender path against the server listener path
        let mut remote = None;
        let mut outgoing = sender.start()?;
        loop {
            let first = remote.is_none().then_some(&hello);
            let step = EstablishStep {
                pairing: SENDER_PAIRING,
                listen_seq,
                msg: outgoing.clone(),
            };
            let (announced, answer) = self.step(&exchange, packet_type, &request, first, step).await?;
            if announced.is_some() {
                remote = announced;
            }
            if sender.is_complete() && outgoing.token.is_none() {
                break;
            }
            match sender.respond(answer)? {
                None => break,
                Some(next) => outgoing = next,
            }
        }
        let remote = remote.ok_or(WireError::Malformed)?;

        // the server sender path against ours; the first step only asks the
        // server to start
        let mut outgoing = HandshakeMsg {
            done: false,
            token: None,
        };
        let mut finished = false;
        loop {
            let step = EstablishStep {
                pairing: LISTENER_PAIRING,
                listen_seq,
                msg: outgoing.clone(),
            };
            let (_, answer) = self.step(&exchange, packet_type, &request, None, step).await?;
            if finished {
                break;
            }
            match listener.respond(answer)? {
                None => break,
                Some(reply) => {
                    finished = listener.is_complete() && reply.token.is_none();
                    outgoing = reply;
                }
            }
        }

        debug!(connection = %request.key, remote = %remote.uri, "http connection established");
        Ok(Established {
            channel: Arc::new(HttpClientChannel {
                exchange,
                sequences: request.sequences.clone(),
                listener_timeout: config.listener_timeout,
                closed: AtomicBool::new(false),
                remote_closed: AtomicBool::new(false),
            }),
            remote,
            sender_session: sender.finish()?,
            listener_session: listener.finish()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_gets_default_path() {
        assert_eq!(endpoint("http://node-a:8080", "/tunnel").unwrap(), "http://node-a:8080/tunnel");
        assert_eq!(endpoint("http://node-a:8080/", "/tunnel").unwrap(), "http://node-a:8080/tunnel");
        assert_eq!(endpoint("http://node-a:8080/rpc", "/tunnel").unwrap(), "http://node-a:8080/rpc");
        assert!(matches!(endpoint("tcp://node-a:7000", "/tunnel"), Err(TransportError::Config(_))));
    }

    #[test]
    fn test_establish_step_layout() {
        let step = EstablishStep {
            pairing: LISTENER_PAIRING,
            listen_seq: 7,
            msg: HandshakeMsg {
                done: true,
                token: Some(Bytes::from_static(b"tok")),
            },
        };
        let encoded = step.encode();
        assert_eq!(&encoded[..5], &[1, 0, 0, 0, 7]);
        assert_eq!(EstablishStep::decode(encoded).unwrap(), step);

        let mut bad = BytesMut::from(&step.encode()[..]);
        bad[0] = 9;
        assert_eq!(EstablishStep::decode(bad.freeze()), Err(WireError::Flag(9)));
    }

    #[test]
    fn test_refusal_mapping() {
        assert!(matches!(refusal(PacketType::PoolFull, "p"), TransportError::PoolFull(_)));
        assert!(matches!(refusal(PacketType::ClosedManually, "p"), TransportError::ClosedManually));
        assert!(matches!(refusal(PacketType::Listening, "p"), TransportError::Desynchronization(_)));
    }
}
