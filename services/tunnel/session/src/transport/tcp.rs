//! Raw TCP transport.
//!
//! Every packet on the socket is one chunk-framed message. The dialling side
//! writes the preamble (version, kind, name), both sides exchange a
//! [`Hello`], then the two security pairings run: dialler sender-path
//! against listener listener-path first, the reverse pairing second.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use tunnel_wire::{frame_bytes, framed_len, ChunkDecoder, HandshakeMsg, Hello, Preamble};

use crate::error::{Result, TransportError};
use crate::manager::ConnectionManager;
use crate::message::ConnectionKey;
use crate::record::Sequences;
use crate::security::{session_pair, HandshakeDriver};
use crate::transport::{Accepted, Channel, ConnectRequest, Connector, Established};

/// URI scheme of socket peers
pub const SCHEME: &str = "tcp://";

/// `host:port` part of a `tcp://host:port[/...]` URI
fn authority(uri: &str) -> Result<&str> {
    let rest = uri
        .strip_prefix(SCHEME)
        .ok_or_else(|| TransportError::Config(format!("{uri:?} is not a {SCHEME} uri")))?;
    Ok(rest.split_once('/').map_or(rest, |(authority, _)| authority))
}

/// Reads chunk-framed packets off a byte stream
struct PacketReader<R> {
    io: R,
    buf: BytesMut,
    decoder: ChunkDecoder,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    fn new(io: R, max_message_size: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(64 * 1024),
            decoder: ChunkDecoder::new(max_message_size),
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let read = self.io.read_buf(&mut self.buf).await?;
        if read == 0 {
            return Err(TransportError::ConnectionClosed("end of stream".into()));
        }
        trace!(read, buffered = self.buf.len(), "socket read");
        Ok(())
    }

    async fn preamble(&mut self) -> Result<Preamble> {
        loop {
            if let Some(preamble) = Preamble::try_decode(&mut self.buf)? {
                return Ok(preamble);
            }
            self.fill().await?;
        }
    }

    async fn next(&mut self) -> Result<Bytes> {
        loop {
            if let Some(mut message) = self.decoder.decode_message(&mut self.buf)? {
                return Ok(message.to_bytes()?);
            }
            self.fill().await?;
        }
    }
}

/// Writes chunk-framed packets to a byte stream
struct PacketWriter<W> {
    io: W,
    chunk_size: usize,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    fn new(io: W, chunk_size: usize) -> Self {
        Self { io, chunk_size }
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut out = BytesMut::with_capacity(framed_len(payload.len(), self.chunk_size));
        frame_bytes(payload, self.chunk_size, &mut out);
        self.io.write_all(&out).await?;
        self.io.flush().await?;
        Ok(())
    }
}

/// Run a pairing from the side that speaks first
async fn initiate<R, W>(reader: &mut PacketReader<R>, writer: &mut PacketWriter<W>, driver: &mut HandshakeDriver) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut last = driver.start()?;
    writer.send(&last.encode()).await?;
    loop {
        if driver.is_complete() && last.token.is_none() {
            return Ok(());
        }
        let msg = HandshakeMsg::decode(reader.next().await?)?;
        match driver.respond(msg)? {
            None => return Ok(()),
            Some(next) => {
                writer.send(&next.encode()).await?;
                last = next;
            }
        }
    }
}

/// Run a pairing from the side that answers
async fn answer<R, W>(reader: &mut PacketReader<R>, writer: &mut PacketWriter<W>, driver: &mut HandshakeDriver) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = HandshakeMsg::decode(reader.next().await?)?;
        match driver.respond(msg)? {
            None => return Ok(()),
            Some(reply) => {
                let finished = driver.is_complete() && reply.token.is_none();
                writer.send(&reply.encode()).await?;
                if finished {
                    return Ok(());
                }
            }
        }
    }
}

/// An established socket
pub struct TcpChannel {
    reader: Mutex<PacketReader<OwnedReadHalf>>,
    writer: Arc<Mutex<PacketWriter<OwnedWriteHalf>>>,
    closed: watch::Sender<bool>,
    remote: SocketAddr,
}

impl TcpChannel {
    fn new(reader: PacketReader<OwnedReadHalf>, writer: PacketWriter<OwnedWriteHalf>, remote: SocketAddr) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Arc::new(Mutex::new(writer)),
            closed: watch::channel(false).0,
            remote,
        }
    }

    /// Address of the remote socket
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.closed.borrow() {
            return Err(TransportError::ConnectionClosed(format!("socket to {} closed", self.remote)));
        }
        Ok(())
    }

    async fn write(&self, packet: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.writer.lock().await.send(packet).await
    }

    async fn read(&self) -> Result<Bytes> {
        self.ensure_open()?;
        let mut closed = self.closed.subscribe();
        let mut reader = self.reader.lock().await;
        tokio::select! {
            packet = reader.next() => packet,
            _ = closed.wait_for(|closed| *closed) => {
                Err(TransportError::ConnectionClosed(format!("socket to {} closed", self.remote)))
            }
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send_packet(&self, packet: Bytes, expect_reply: bool) -> Result<Option<Bytes>> {
        self.write(&packet).await?;
        if !expect_reply {
            return Ok(None);
        }
        self.read().await.map(Some)
    }

    async fn recv_packet(&self) -> Result<Option<Bytes>> {
        self.read().await.map(Some)
    }

    fn close(&self, reason: &TransportError) {
        if self.closed.send_replace(true) {
            return;
        }
        debug!(remote = %self.remote, %reason, "closing socket");
        let writer = self.writer.clone();
        tokio::spawn(async move {
            // the peer sees end of stream; errors mean it is gone already
            let _ = writer.lock().await.io.shutdown().await;
        });
    }
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("remote", &self.remote)
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

/// Dials `tcp://host:port` peers
#[derive(Debug, Default, Clone)]
pub struct TcpConnector;

impl TcpConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Channel = TcpChannel;

    async fn connect(&self, request: ConnectRequest) -> Result<Established<TcpChannel>> {
        let config = &request.config;
        let authority = authority(request.peer.uri())?;
        let addr = lookup_host(authority)
            .await?
            .next()
            .ok_or_else(|| TransportError::ConnectionClosed(format!("{authority} did not resolve")))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(size) = config.tcp_send_buffer {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = config.tcp_recv_buffer {
            socket.set_recv_buffer_size(size)?;
        }
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(config.tcp_nodelay)?;
        request.peer.set_address(addr);
        debug!(connection = %request.key, %addr, "socket connected");

        let (read, write) = stream.into_split();
        let mut reader = PacketReader::new(read, config.max_message_size);
        let mut writer = PacketWriter::new(write, config.chunk_size);

        let mut preamble = BytesMut::new();
        Preamble::new(request.key.kind, request.key.name.clone()).encode(&mut preamble);
        writer.io.write_all(&preamble).await?;
        writer.send(&request.local.hello().encode()).await?;
        let remote = Hello::decode(reader.next().await?)?;

        let (sender, listener) = session_pair(&request.security, config.security_session.as_deref())?;
        let mut sender = HandshakeDriver::new(sender);
        let mut listener = HandshakeDriver::new(listener);
        initiate(&mut reader, &mut writer, &mut sender).await?;
        answer(&mut reader, &mut writer, &mut listener).await?;
        request.sequences.reset();

        Ok(Established {
            channel: Arc::new(TcpChannel::new(reader, writer, addr)),
            remote,
            sender_session: sender.finish()?,
            listener_session: listener.finish()?,
        })
    }
}

impl ConnectionManager<TcpConnector> {
    /// Bind `addr` and accept connections until shutdown. Returns the bound
    /// address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        info!(addr = %bound, "tcp listener started");

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
                    if let Err(error) = this.serve_socket(stream, remote).await {
                        warn!(%remote, %error, "inbound connection failed");
                    }
                });
            }
            info!(addr = %bound, "tcp listener stopped");
        });
        Ok(bound)
    }

    async fn serve_socket(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let config = self.inner.config.clone();
        stream.set_nodelay(config.tcp_nodelay)?;
        let (read, write) = stream.into_split();
        let mut reader = PacketReader::new(read, config.max_message_size);
        let mut writer = PacketWriter::new(write, config.chunk_size);

        let opening = async {
            let preamble = reader.preamble().await?;
            let remote = Hello::decode(reader.next().await?)?;
            writer.send(&self.inner.local.hello().encode()).await?;

            let (factory, name) = self.security();
            let (sender, listener) = session_pair(factory, name)?;
            let mut listener = HandshakeDriver::new(listener);
            let mut sender = HandshakeDriver::new(sender);
            answer(&mut reader, &mut writer, &mut listener).await?;
            initiate(&mut reader, &mut writer, &mut sender).await?;
            Ok::<_, TransportError>((preamble, remote, sender.finish()?, listener.finish()?))
        };
        let (preamble, remote, sender_session, listener_session) = timeout(config.connect_timeout, opening)
            .await
            .map_err(|_| TransportError::ConnectTimeout(addr.to_string()))??;

        let kind = preamble.kind;
        let key = ConnectionKey::new(remote.uri.clone(), preamble.name, kind);
        debug!(connection = %key, %addr, "socket accepted");
        let channel = Arc::new(TcpChannel::new(reader, writer, addr));
        let record = self
            .accept(Accepted {
                key,
                remote,
                version: preamble.version,
                wire_id: Uuid::new_v4(),
                channel: channel.clone(),
                sequences: Arc::new(Sequences::new()),
                sender_session,
                listener_session,
            })
            .await?;
        if kind.is_long_lived() {
            return Ok(());
        }

        let exchange = async {
            let packet = channel.read().await?;
            if let Some(reply) = self.handle_exchange(&record, packet).await? {
                channel.write(&reply).await?;
            }
            Ok(())
        }
        .await;
        self.close_record(&record, TransportError::ClosedManually);
        exchange
    }
}
