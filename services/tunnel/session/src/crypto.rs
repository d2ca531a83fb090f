//! Pre-shared-key security session using XChaCha20-Poly1305.
//!
//! The initiator sends a random challenge, the responder proves knowledge of
//! the key by sealing it. Since the sender path and the listener path pair in
//! opposite directions, both sides end up authenticated.

use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use std::fmt;

use crate::error::{Result, TransportError};
use crate::security::{SecuritySession, SecuritySessionFactory};

const TAG_CHALLENGE: u8 = 0x01;
const TAG_PROOF: u8 = 0x02;
const CHALLENGE_LEN: usize = 16;
const NONCE_LEN: usize = 24;

/// Length of a pre-shared key
pub const PSK_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fresh,
    AwaitProof([u8; CHALLENGE_LEN]),
    Established,
}

/// Session authenticated and encrypted with a pre-shared key
pub struct PskSession {
    name: String,
    cipher: XChaCha20Poly1305,
    phase: Phase,
}

impl PskSession {
    /// New session for `key`
    pub fn new(name: impl Into<String>, key: &[u8; PSK_LEN]) -> Self {
        Self {
            name: name.into(),
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
            phase: Phase::Fresh,
        }
    }

    fn seal(&self, plain: &[u8]) -> Result<Bytes> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plain)
            .map_err(|_| TransportError::Security("encryption failed".into()))?;
        let mut out = BytesMut::with_capacity(NONCE_LEN + sealed.len());
        out.put_slice(&nonce);
        out.put_slice(&sealed);
        Ok(out.freeze())
    }

    fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(TransportError::Security("sealed packet too short".into()));
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| TransportError::Security("packet failed authentication".into()))
    }
}

impl fmt::Debug for PskSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PskSession")
            .field("name", &self.name)
            .field("established", &self.is_established())
            .finish()
    }
}

impl SecuritySession for PskSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn establish(&mut self, input: Option<&[u8]>) -> Result<Option<Bytes>> {
        match (self.phase, input) {
            (Phase::Fresh, None) => {
                let challenge: [u8; CHALLENGE_LEN] = rand::random();
                self.phase = Phase::AwaitProof(challenge);
                let mut out = BytesMut::with_capacity(1 + CHALLENGE_LEN);
                out.put_u8(TAG_CHALLENGE);
                out.put_slice(&challenge);
                Ok(Some(out.freeze()))
            }
            (Phase::Fresh, Some(token)) => {
                if token.len() != 1 + CHALLENGE_LEN || token[0] != TAG_CHALLENGE {
                    return Err(TransportError::Authentication("malformed challenge".into()));
                }
                let proof = self.seal(&token[1..])?;
                self.phase = Phase::Established;
                let mut out = BytesMut::with_capacity(1 + proof.len());
                out.put_u8(TAG_PROOF);
                out.put_slice(&proof);
                Ok(Some(out.freeze()))
            }
            (Phase::AwaitProof(challenge), Some(token)) => {
                if token.first() != Some(&TAG_PROOF) {
                    return Err(TransportError::Authentication("malformed proof".into()));
                }
                let opened = self
                    .open(&token[1..])
                    .map_err(|_| TransportError::Authentication("peer does not hold the key".into()))?;
                if opened != challenge {
                    return Err(TransportError::Authentication("challenge mismatch".into()));
                }
                self.phase = Phase::Established;
                Ok(None)
            }
            (Phase::AwaitProof(_), None) => Err(TransportError::Authentication(
                "peer ended the handshake without a proof".into(),
            )),
            (Phase::Established, _) => Ok(None),
        }
    }

    fn is_established(&self) -> bool {
        self.phase == Phase::Established
    }

    fn encrypt(&mut self, plain: Bytes) -> Result<Bytes> {
        if !self.is_established() {
            return Err(TransportError::Security("session not established".into()));
        }
        self.seal(&plain)
    }

    fn decrypt(&mut self, cipher: Bytes) -> Result<Bytes> {
        if !self.is_established() {
            return Err(TransportError::Security("session not established".into()));
        }
        self.open(&cipher).map(Bytes::from)
    }
}

/// Factory for [`PskSession`]s sharing one key
#[derive(Clone)]
pub struct PskSessionFactory {
    key: [u8; PSK_LEN],
}

impl PskSessionFactory {
    /// Factory for a raw key
    pub fn new(key: [u8; PSK_LEN]) -> Self {
        Self { key }
    }

    /// Factory for a key written as 64 hex digits
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.len() != PSK_LEN * 2 || !hex.is_ascii() {
            return Err(TransportError::Config(format!(
                "pre-shared key must be {} hex digits",
                PSK_LEN * 2
            )));
        }
        let mut key = [0u8; PSK_LEN];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| TransportError::Config("pre-shared key is not hex".into()))?;
        }
        Ok(Self { key })
    }
}

impl fmt::Debug for PskSessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PskSessionFactory { .. }")
    }
}

impl SecuritySessionFactory for PskSessionFactory {
    fn create(&self, name: &str) -> Result<Box<dyn SecuritySession>> {
        Ok(Box::new(PskSession::new(name, &self.key)))
    }
}
