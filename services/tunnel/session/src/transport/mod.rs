//! Transport primitives behind the connection manager.
//!
//! A [`Connector`] opens physical connections; a [`Channel`] moves whole
//! packets over one of them. The manager owns everything above: queueing,
//! packing, security filtering, reconnection.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use uuid::Uuid;

use tunnel_wire::Hello;

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::message::ConnectionKey;
use crate::peer::Peer;
use crate::record::Sequences;
use crate::security::{SecuritySession, SecuritySessionFactory};

pub mod http_client;
pub mod http_server;
pub mod tcp;

/// Identity this process announces to peers
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// Local URI
    pub uri: String,
    /// Incarnation identifier, fresh for every manager instance
    pub host_id: i32,
}

impl LocalIdentity {
    /// Identity for `uri` with a random host id
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            host_id: rand::random(),
        }
    }

    /// Hello message announcing this identity
    pub fn hello(&self) -> Hello {
        Hello {
            uri: self.uri.clone(),
            host_id: self.host_id,
        }
    }
}

/// One physical connection able to carry packets
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Deliver one packet. With `expect_reply` the call returns the single
    /// packet the remote answers with.
    async fn send_packet(&self, packet: Bytes, expect_reply: bool) -> Result<Option<Bytes>>;

    /// Wait for the next inbound packet; `Ok(None)` means nothing arrived
    /// and the caller should simply poll again
    async fn recv_packet(&self) -> Result<Option<Bytes>>;

    /// Tear the connection down
    fn close(&self, reason: &TransportError);
}

/// Everything a connector needs to open a connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Target connection
    pub key: ConnectionKey,
    /// Target peer
    pub peer: Arc<Peer>,
    /// Wire identifier of the logical connection
    pub wire_id: Uuid,
    /// Counters to resume from
    pub sequences: Arc<Sequences>,
    /// First establishment of this logical connection
    pub reset: bool,
    /// Local identity
    pub local: LocalIdentity,
    /// Transport configuration
    pub config: Arc<TransportConfig>,
    /// Source of security sessions
    pub security: Arc<dyn SecuritySessionFactory>,
}

/// A freshly opened connection, handshake completed
pub struct Established<C> {
    /// Packet channel
    pub channel: Arc<C>,
    /// Identity announced by the remote
    pub remote: Hello,
    /// Established sender-path session
    pub sender_session: Box<dyn SecuritySession>,
    /// Established listener-path session
    pub listener_session: Box<dyn SecuritySession>,
}

/// A connection opened by a remote, handshake completed
pub struct Accepted<C> {
    /// Connection key, with the remote's URI as peer
    pub key: ConnectionKey,
    /// Identity announced by the remote
    pub remote: Hello,
    /// Protocol version the remote speaks
    pub version: u8,
    /// Wire identifier of the logical connection
    pub wire_id: Uuid,
    /// Packet channel
    pub channel: Arc<C>,
    /// Counters of the connection
    pub sequences: Arc<Sequences>,
    /// Established sender-path session
    pub sender_session: Box<dyn SecuritySession>,
    /// Established listener-path session
    pub listener_session: Box<dyn SecuritySession>,
}

/// Opens physical connections of one transport
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Channel type produced by this connector
    type Channel: Channel;

    /// Open a connection and run the full handshake
    async fn connect(&self, request: ConnectRequest) -> Result<Established<Self::Channel>>;

    /// Whether this side can open connections at all
    fn can_dial(&self) -> bool {
        true
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transport counting physical sends.

    use super::*;
    use crate::security::NoSecurity;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};
    use tunnel_wire::unpack_labelled;

    /// Scripted outcome of a physical send
    #[derive(Debug, Clone)]
    pub(crate) enum SendOutcome {
        Deliver,
        Fail(TransportError),
        Reply(Bytes),
    }

    #[derive(Debug, Default)]
    pub(crate) struct MockState {
        /// Packets written, in order
        pub(crate) sent: Mutex<Vec<Bytes>>,
        /// Sends currently running
        pub(crate) in_flight: AtomicUsize,
        /// Highest concurrency observed
        pub(crate) max_in_flight: AtomicUsize,
        /// Outcomes consumed by the next sends; `Deliver` once empty
        pub(crate) script: Mutex<VecDeque<SendOutcome>>,
        /// Delay of every send
        pub(crate) send_delay: Mutex<Duration>,
        /// Physical connections opened
        pub(crate) connects: AtomicUsize,
        /// Fail connection attempts while set
        pub(crate) refuse: AtomicBool,
        /// Woken after every send
        pub(crate) progress: Notify,
        /// Remote host id announced on connect
        pub(crate) remote_host_id: Mutex<i32>,
    }

    impl MockState {
        /// Message payloads of every packet written, in order
        pub(crate) fn payloads(&self) -> Vec<Vec<u8>> {
            self.sent
                .lock()
                .iter()
                .flat_map(|packet| unpack_labelled(packet.clone(), usize::MAX).unwrap_or_default())
                .map(|mut message| message.to_bytes().map(|b| b.to_vec()).unwrap_or_default())
                .collect()
        }
    }

    pub(crate) struct MockChannel {
        state: Arc<MockState>,
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Bytes>>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Channel for MockChannel {
        async fn send_packet(&self, packet: Bytes, _expect_reply: bool) -> Result<Option<Bytes>> {
            let state = &self.state;
            let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = *state.send_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = state.script.lock().pop_front().unwrap_or(SendOutcome::Deliver);
            state.in_flight.fetch_sub(1, Ordering::SeqCst);

            let result = match outcome {
                SendOutcome::Deliver => {
                    state.sent.lock().push(packet);
                    Ok(None)
                }
                SendOutcome::Reply(reply) => {
                    state.sent.lock().push(packet);
                    Ok(Some(reply))
                }
                SendOutcome::Fail(error) => Err(error),
            };
            state.progress.notify_waiters();
            result
        }

        async fn recv_packet(&self) -> Result<Option<Bytes>> {
            match self.inbound.lock().await.recv().await {
                Some(packet) => packet.map(Some),
                None => Err(TransportError::ConnectionClosed("mock inbound ended".into())),
            }
        }

        fn close(&self, _reason: &TransportError) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Connector handing out mock channels
    #[derive(Debug, Default)]
    pub(crate) struct MockConnector {
        pub(crate) state: Arc<MockState>,
        /// Inbound feeds of every channel opened, in order
        pub(crate) feeds: Mutex<Vec<mpsc::UnboundedSender<Result<Bytes>>>>,
    }

    impl MockConnector {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Channel not owned by a connector, for accepted connections
        pub(crate) fn channel(&self) -> (Arc<MockChannel>, mpsc::UnboundedSender<Result<Bytes>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let channel = Arc::new(MockChannel {
                state: self.state.clone(),
                inbound: tokio::sync::Mutex::new(rx),
                closed: AtomicBool::new(false),
            });
            (channel, tx)
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Channel = MockChannel;

        async fn connect(&self, request: ConnectRequest) -> Result<Established<MockChannel>> {
            if self.state.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionClosed(format!("{} refused", request.peer.uri())));
            }
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            let (channel, feed) = self.channel();
            self.feeds.lock().push(feed);
            Ok(Established {
                channel,
                remote: Hello {
                    uri: request.peer.uri().to_string(),
                    host_id: *self.state.remote_host_id.lock(),
                },
                sender_session: Box::new(NoSecurity),
                listener_session: Box::new(NoSecurity),
            })
        }
    }
}
