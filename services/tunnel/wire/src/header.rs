//! Control headers carried by every HTTP request and response.
//!
//! Integers are big-endian here; only the socket chunk header is
//! little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use uuid::Uuid;

use crate::primitives::{get_string, need, put_string, string_len};
use crate::WireError;

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Magic byte opening every HTTP control header
pub const HTTP_MAGIC: u8 = 0x4D;

/// Logical connection kinds
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Long-lived, reused for many messages, survives reconnection
    Persistent = 0,
    /// Long-lived, explicitly addressed by name and independently lifetimed
    Named = 1,
    /// Single request/reply exchange
    Invocation = 2,
    /// Single request, no reply expected
    OneWay = 3,
}

impl ConnectionKind {
    /// Whether the connection is kept and reestablished after failures
    pub fn is_long_lived(self) -> bool {
        matches!(self, ConnectionKind::Persistent | ConnectionKind::Named)
    }

    /// Whether the remote caller waits synchronously for this exchange
    pub fn is_synchronous(self) -> bool {
        self == ConnectionKind::Invocation
    }

    /// Whether one outbound packet expects one reply packet
    pub fn expects_reply(self) -> bool {
        self == ConnectionKind::Invocation
    }
}

impl TryFrom<u8> for ConnectionKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectionKind::Persistent),
            1 => Ok(ConnectionKind::Named),
            2 => Ok(ConnectionKind::Invocation),
            3 => Ok(ConnectionKind::OneWay),
            _ => Err(WireError::Kind(value)),
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionKind::Persistent => "persistent",
            ConnectionKind::Named => "named",
            ConnectionKind::Invocation => "invocation",
            ConnectionKind::OneWay => "one-way",
        };
        f.write_str(name)
    }
}

/// Packet types of the HTTP control header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Regular data packet
    Usual = 0,
    /// Listener poll waiting for server-to-client data
    Listening = 1,
    /// Connection (re)establishment keeping sequence state
    Establishing = 2,
    /// First establishment of a client instance; resets server state
    EstablishingResetConnection = 3,
    /// Sequence numbers no longer match
    Desynchronization = 4,
    /// The remote failed to process the request
    SenderError = 5,
    /// A listener poll expired without data
    ListenerTimedOut = 6,
    /// The remote released the connection
    ClosedManually = 7,
    /// The remote refused the connection for capacity reasons
    PoolFull = 8,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Usual),
            1 => Ok(PacketType::Listening),
            2 => Ok(PacketType::Establishing),
            3 => Ok(PacketType::EstablishingResetConnection),
            4 => Ok(PacketType::Desynchronization),
            5 => Ok(PacketType::SenderError),
            6 => Ok(PacketType::ListenerTimedOut),
            7 => Ok(PacketType::ClosedManually),
            8 => Ok(PacketType::PoolFull),
            _ => Err(WireError::PacketType(value)),
        }
    }
}

fn get_magic(buf: &mut Bytes) -> Result<(), WireError> {
    need(buf, 1)?;
    let found = buf.get_u8();
    if found != HTTP_MAGIC {
        return Err(WireError::BadMagic {
            expected: HTTP_MAGIC,
            found,
        });
    }
    Ok(())
}

/// Header of every HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// Protocol version spoken by the client
    pub version: u8,
    /// Connection kind
    pub kind: ConnectionKind,
    /// Client connection identifier
    pub peer_id: Uuid,
    /// Packet type
    pub packet_type: PacketType,
    /// Sequence number of this request in its direction
    pub sequence: i32,
    /// Logical connection name (version 1 and later)
    pub connection_name: String,
    /// Client host incarnation identifier (version 1 and later)
    pub host_id: i32,
}

impl RequestHeader {
    /// Encoded size of this header
    pub fn encoded_len(&self) -> usize {
        let mut len = 1 + 1 + 1 + 16 + 1 + 4;
        if self.version >= 1 {
            len += string_len(&self.connection_name) + 4;
        }
        len
    }

    /// Encode header to buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(HTTP_MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.kind as u8);
        buf.put_slice(self.peer_id.as_bytes());
        buf.put_u8(self.packet_type as u8);
        buf.put_i32(self.sequence);
        if self.version >= 1 {
            put_string(buf, &self.connection_name);
            buf.put_i32(self.host_id);
        }
    }

    /// Decode header from buffer
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        get_magic(buf)?;
        need(buf, 1 + 1 + 16 + 1 + 4)?;

        let version = buf.get_u8();
        if version > WIRE_VERSION {
            return Err(WireError::Version(version));
        }
        let kind = ConnectionKind::try_from(buf.get_u8())?;
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let packet_type = PacketType::try_from(buf.get_u8())?;
        let sequence = buf.get_i32();

        let (connection_name, host_id) = if version >= 1 {
            let name = get_string(buf)?;
            need(buf, 4)?;
            (name, buf.get_i32())
        } else {
            (String::new(), 0)
        };

        Ok(Self {
            version,
            kind,
            peer_id: Uuid::from_bytes(id),
            packet_type,
            sequence,
            connection_name,
            host_id,
        })
    }
}

/// Header of every HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    /// URI of the answering server
    pub server_uri: String,
    /// Sequence number being answered
    pub sequence: i32,
    /// Packet type
    pub packet_type: PacketType,
    /// Server host incarnation identifier (version 1 and later)
    pub host_id: i32,
}

impl ResponseHeader {
    /// Encode header for a client speaking `version`
    pub fn encode(&self, version: u8, buf: &mut BytesMut) {
        buf.put_u8(HTTP_MAGIC);
        put_string(buf, &self.server_uri);
        buf.put_i32(self.sequence);
        buf.put_u8(self.packet_type as u8);
        if version > 0 {
            buf.put_i32(self.host_id);
        }
    }

    /// Decode a header written for `version`
    pub fn decode(buf: &mut Bytes, version: u8) -> Result<Self, WireError> {
        get_magic(buf)?;
        let server_uri = get_string(buf)?;
        need(buf, 4 + 1)?;
        let sequence = buf.get_i32();
        let packet_type = PacketType::try_from(buf.get_u8())?;
        let host_id = if version > 0 {
            need(buf, 4)?;
            buf.get_i32()
        } else {
            0
        };

        Ok(Self {
            server_uri,
            sequence,
            packet_type,
            host_id,
        })
    }
}
