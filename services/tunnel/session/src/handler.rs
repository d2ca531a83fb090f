//! Callbacks into the layer above the transport.

use async_trait::async_trait;
use std::sync::Arc;
use tunnel_wire::{ConnectionKind, FramedBuffer};

use crate::error::TransportError;
use crate::message::Message;
use crate::peer::Peer;

/// One fully framed inbound message
#[derive(Debug)]
pub struct InboundMessage {
    /// Message content
    pub content: FramedBuffer,
    /// Peer the message came from
    pub peer: Arc<Peer>,
    /// Kind of the carrying connection
    pub kind: ConnectionKind,
    /// Logical name of the carrying connection
    pub connection_name: String,
    /// Whether the remote caller is blocked waiting for a reply
    pub is_synchronous: bool,
    /// Name of the security session protecting the connection
    pub security_session: Option<String>,
}

/// Message dispatch handler
///
/// `handle_message` runs once per inbound message, in wire order. For
/// Invocation connections the returned buffer is sent back as the reply;
/// on other kinds it is ignored.
#[async_trait]
pub trait DispatchHandler: Send + Sync + std::fmt::Debug {
    /// Process an inbound message
    async fn handle_message(&self, message: InboundMessage) -> Option<FramedBuffer>;

    /// Report a message that could not be delivered
    fn dispatch_exception(&self, message: Message, error: TransportError);
}
