//! Connection pool, outbound queues, reconnection and transports for tunnel.
//!
//! A [`ConnectionManager`] owns every logical connection to remote peers,
//! keyed by [`ConnectionKey`] (peer URI, connection name, kind). Messages are
//! queued per connection and drained by whichever task acquires the send
//! lock, packing as many as fit into one labelled packet. Failed long-lived
//! connections are reestablished without losing the queue; HTTP connections
//! resume their sequence numbers under the same connection GUID.
//!
//! ## Features
//!
//! - **TCP transport**: preamble, hello exchange and chunk-framed packets
//! - **HTTP transport**: request/response packets with long-polling for the
//!   server-to-client direction
//! - **Connection kinds**: persistent, named, invocation and one-way
//! - **Reconnection**: bounded retries with a deadline, duplicate suppression
//! - **Housekeeping**: pings, inactivity close, queued message expiry
//! - **Security sessions**: pluggable, with a pre-shared key implementation
//!   behind the `crypto` feature
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tunnel_session::{
//!     ConnectionKey, ConnectionManager, DispatchHandler, InboundMessage, Message,
//!     NoSecurityFactory, TcpConnector, TransportConfig, TransportError,
//! };
//! use tunnel_wire::FramedBuffer;
//!
//! #[derive(Debug)]
//! struct Print;
//!
//! #[async_trait::async_trait]
//! impl DispatchHandler for Print {
//!     async fn handle_message(&self, mut message: InboundMessage) -> Option<FramedBuffer> {
//!         println!("{} bytes from {}", message.content.to_bytes().ok()?.len(), message.peer.uri());
//!         None
//!     }
//!
//!     fn dispatch_exception(&self, message: Message, error: TransportError) {
//!         eprintln!("message {} failed: {}", message.id(), error);
//!     }
//! }
//!
//! # async fn example() -> tunnel_session::Result<()> {
//! let manager = ConnectionManager::new(
//!     TransportConfig::default(),
//!     "tcp://10.0.0.1:7000",
//!     TcpConnector::new(),
//!     Arc::new(Print),
//!     Arc::new(NoSecurityFactory),
//! )?;
//! manager.listen("0.0.0.0:7000".parse().unwrap()).await?;
//!
//! let key = ConnectionKey::persistent("tcp://10.0.0.2:7000");
//! manager
//!     .send(Message::new(key, FramedBuffer::from_bytes(&b"hello"[..])))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod handler;
mod housekeeping;
pub mod manager;
pub mod message;
pub mod peer;
pub mod queue;
mod reconnect;
pub mod record;
pub mod security;
pub mod transport;

#[cfg(feature = "crypto")]
pub mod crypto;

// Re-export main types
pub use config::{ParameterProvider, TransportConfig};
pub use error::{ErrorClass, Result, TransportError};
pub use handler::{DispatchHandler, InboundMessage};
pub use manager::{ConnectionEvent, ConnectionManager, ConnectionSnapshot};
pub use message::{ConnectionKey, Message, DEFAULT_CONNECTION_NAME};
pub use peer::{Peer, PeerRegistry};
pub use record::{Origin, StatsSnapshot};
pub use security::{HandshakeDriver, NoSecurity, NoSecurityFactory, SecuritySession, SecuritySessionFactory, NO_SECURITY};
pub use transport::http_client::HttpClientConnector;
pub use transport::http_server::HttpServerConnector;
pub use transport::tcp::TcpConnector;
pub use transport::{Channel, Connector, LocalIdentity};

#[cfg(feature = "crypto")]
pub use crypto::{PskSession, PskSessionFactory, PSK_LEN};
