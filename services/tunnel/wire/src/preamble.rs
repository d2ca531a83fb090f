//! Socket connection-open preamble, identity hello and handshake messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::header::{ConnectionKind, WIRE_VERSION};
use crate::primitives::{get_flag, get_string, need, put_string, string_len};
use crate::WireError;

/// First bytes written by the dialling side of a socket connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    /// Protocol version of the dialling side
    pub version: u8,
    /// Kind of the connection being opened
    pub kind: ConnectionKind,
    /// Logical connection name
    pub name: String,
}

impl Preamble {
    /// Preamble for the current protocol version
    pub fn new(kind: ConnectionKind, name: impl Into<String>) -> Self {
        Self {
            version: WIRE_VERSION,
            kind,
            name: name.into(),
        }
    }

    /// Encoded size
    pub fn encoded_len(&self) -> usize {
        2 + string_len(&self.name)
    }

    /// Encode preamble to buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.kind as u8);
        put_string(buf, &self.name);
    }

    /// Decode a preamble from the front of `buf`, consuming it.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the preamble is
    /// incomplete.
    pub fn try_decode(buf: &mut BytesMut) -> Result<Option<Self>, WireError> {
        let mut view = Bytes::copy_from_slice(buf);
        match Self::decode(&mut view) {
            Ok(preamble) => {
                let used = buf.len() - view.len();
                buf.advance(used);
                Ok(Some(preamble))
            }
            Err(WireError::Incomplete) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Decode preamble from buffer
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, 2)?;
        let version = buf.get_u8();
        if version == 0 || version > WIRE_VERSION {
            return Err(WireError::Version(version));
        }
        let kind = ConnectionKind::try_from(buf.get_u8())?;
        let name = get_string(buf)?;
        Ok(Self {
            version,
            kind,
            name,
        })
    }
}

/// Identity announced by both sides right after the preamble
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Stable URI of the sender
    pub uri: String,
    /// Host incarnation identifier, changes on every process start
    pub host_id: i32,
}

impl Hello {
    /// Encode hello payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(string_len(&self.uri) + 4);
        put_string(&mut buf, &self.uri);
        buf.put_i32_le(self.host_id);
        buf.freeze()
    }

    /// Decode hello payload
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let uri = get_string(&mut buf)?;
        need(&buf, 4)?;
        let host_id = buf.get_i32_le();
        if buf.has_remaining() {
            return Err(WireError::Malformed);
        }
        Ok(Self { uri, host_id })
    }
}

/// One security handshake step: `[done:1][token...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMsg {
    /// Whether the sender considers its side of the handshake complete
    pub done: bool,
    /// Token for the peer, absent when the sender has nothing more to say
    pub token: Option<Bytes>,
}

impl HandshakeMsg {
    /// Encode handshake message
    pub fn encode(&self) -> Bytes {
        let token_len = self.token.as_ref().map_or(0, Bytes::len);
        let mut buf = BytesMut::with_capacity(1 + token_len);
        buf.put_u8(self.done as u8);
        if let Some(token) = &self.token {
            buf.put_slice(token);
        }
        buf.freeze()
    }

    /// Decode handshake message; an empty token decodes as `None`
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let done = get_flag(&mut buf)?;
        let token = if buf.is_empty() { None } else { Some(buf) };
        Ok(Self { done, token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preamble_incremental() {
        let preamble = Preamble::new(ConnectionKind::Persistent, "default");
        let mut wire = BytesMut::new();
        preamble.encode(&mut wire);
        assert_eq!(wire.len(), preamble.encoded_len());
        wire.put_slice(b"rest");

        let mut input = BytesMut::from(&wire[..4]);
        assert_eq!(Preamble::try_decode(&mut input).unwrap(), None);
        assert_eq!(input.len(), 4);

        input.put_slice(&wire[4..]);
        assert_eq!(Preamble::try_decode(&mut input).unwrap(), Some(preamble));
        assert_eq!(&input[..], b"rest");
    }

    #[test]
    fn test_preamble_rejects_unknown_kind() {
        let mut input = BytesMut::from(&[WIRE_VERSION, 9, 0][..]);
        assert_eq!(Preamble::try_decode(&mut input), Err(WireError::Kind(9)));
    }

    #[test]
    fn test_hello_rejects_trailing_bytes() {
        let hello = Hello {
            uri: "tcp://node-b:7000".into(),
            host_id: 1234,
        };
        assert_eq!(Hello::decode(hello.encode()).unwrap(), hello);

        let mut padded = BytesMut::from(&hello.encode()[..]);
        padded.put_u8(0);
        assert_eq!(Hello::decode(padded.freeze()), Err(WireError::Malformed));
    }

    #[test]
    fn test_handshake_without_token() {
        let msg = HandshakeMsg {
            done: true,
            token: None,
        };
        let encoded = msg.encode();
        assert_eq!(&encoded[..], &[1]);
        assert_eq!(HandshakeMsg::decode(encoded).unwrap(), msg);
        assert_eq!(HandshakeMsg::decode(Bytes::new()), Err(WireError::Incomplete));
    }
}
