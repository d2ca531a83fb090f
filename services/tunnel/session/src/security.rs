//! Security session slot: pluggable handshake plus encrypt/decrypt filter.
//!
//! Every connection carries two sessions, one for the sender path and one for
//! the listener path. A sender-path session is paired with the remote
//! listener-path session through [`HandshakeDriver`], which exchanges
//! [`HandshakeMsg`]s until both sides have nothing more to say.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tunnel_wire::HandshakeMsg;

use crate::error::{Result, TransportError};

/// Name used when no security session is configured
pub const NO_SECURITY: &str = "none";

/// A two-phase security session
pub trait SecuritySession: Send + fmt::Debug {
    /// Session name, as passed to the factory
    fn name(&self) -> &str;

    /// Consume the peer's token (none on the initiating call) and produce the
    /// next token for the peer; `None` means this side is done
    fn establish(&mut self, input: Option<&[u8]>) -> Result<Option<Bytes>>;

    /// Whether the handshake completed on this side
    fn is_established(&self) -> bool;

    /// Protect an outgoing packet
    fn encrypt(&mut self, plain: Bytes) -> Result<Bytes>;

    /// Unwrap an incoming packet
    fn decrypt(&mut self, cipher: Bytes) -> Result<Bytes>;
}

/// Creates fresh security sessions by name
pub trait SecuritySessionFactory: Send + Sync + fmt::Debug {
    /// New session instance
    fn create(&self, name: &str) -> Result<Box<dyn SecuritySession>>;
}

/// Pass-through session
#[derive(Debug, Default, Clone)]
pub struct NoSecurity;

impl SecuritySession for NoSecurity {
    fn name(&self) -> &str {
        NO_SECURITY
    }

    fn establish(&mut self, _input: Option<&[u8]>) -> Result<Option<Bytes>> {
        Ok(None)
    }

    fn is_established(&self) -> bool {
        true
    }

    fn encrypt(&mut self, plain: Bytes) -> Result<Bytes> {
        Ok(plain)
    }

    fn decrypt(&mut self, cipher: Bytes) -> Result<Bytes> {
        Ok(cipher)
    }
}

/// Factory handing out [`NoSecurity`] for every name
#[derive(Debug, Default, Clone)]
pub struct NoSecurityFactory;

impl SecuritySessionFactory for NoSecurityFactory {
    fn create(&self, _name: &str) -> Result<Box<dyn SecuritySession>> {
        Ok(Box::new(NoSecurity))
    }
}

/// Create the pair of sessions for a new connection
pub(crate) fn session_pair(
    factory: &Arc<dyn SecuritySessionFactory>,
    name: Option<&str>,
) -> Result<(Box<dyn SecuritySession>, Box<dyn SecuritySession>)> {
    let name = name.unwrap_or(NO_SECURITY);
    Ok((factory.create(name)?, factory.create(name)?))
}

/// Drives one side of a handshake pairing
#[derive(Debug)]
pub struct HandshakeDriver {
    session: Box<dyn SecuritySession>,
    local_done: bool,
    peer_done: bool,
}

impl HandshakeDriver {
    /// Wrap a fresh session
    pub fn new(session: Box<dyn SecuritySession>) -> Self {
        Self {
            session,
            local_done: false,
            peer_done: false,
        }
    }

    /// First message of the initiating side
    pub fn start(&mut self) -> Result<HandshakeMsg> {
        self.turn(None)
    }

    /// Answer a peer message; `None` once both sides are done and the peer
    /// sent no further token
    pub fn respond(&mut self, msg: HandshakeMsg) -> Result<Option<HandshakeMsg>> {
        self.peer_done = msg.done;
        if self.local_done && self.peer_done && msg.token.is_none() {
            return Ok(None);
        }
        self.turn(msg.token).map(Some)
    }

    fn turn(&mut self, input: Option<Bytes>) -> Result<HandshakeMsg> {
        let token = if self.local_done && input.is_none() {
            None
        } else {
            self.session.establish(input.as_deref())?
        };
        self.local_done = self.session.is_established() || token.is_none();
        Ok(HandshakeMsg {
            done: self.local_done,
            token,
        })
    }

    /// Whether both sides reported completion
    pub fn is_complete(&self) -> bool {
        self.local_done && self.peer_done
    }

    /// The established session
    pub fn finish(self) -> Result<Box<dyn SecuritySession>> {
        if !self.is_complete() {
            return Err(TransportError::Security(format!(
                "handshake of {} did not complete",
                self.session.name()
            )));
        }
        Ok(self.session)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Toy session needing two token rounds before it is established
    #[derive(Debug, Default)]
    pub(crate) struct CountingSession {
        rounds: u8,
    }

    impl SecuritySession for CountingSession {
        fn name(&self) -> &str {
            "counting"
        }

        fn establish(&mut self, input: Option<&[u8]>) -> Result<Option<Bytes>> {
            if let Some(token) = input {
                self.rounds = self.rounds.max(token[0]);
            }
            if self.rounds >= 2 {
                return Ok(None);
            }
            self.rounds += 1;
            Ok(Some(Bytes::copy_from_slice(&[self.rounds])))
        }

        fn is_established(&self) -> bool {
            self.rounds >= 2
        }

        fn encrypt(&mut self, plain: Bytes) -> Result<Bytes> {
            Ok(plain.iter().map(|b| b ^ 0x5A).collect::<Vec<u8>>().into())
        }

        fn decrypt(&mut self, cipher: Bytes) -> Result<Bytes> {
            self.encrypt(cipher)
        }
    }

    /// Run a pairing over an in-memory exchange; returns the message count
    pub(crate) fn run_pairing(initiator: &mut HandshakeDriver, responder: &mut HandshakeDriver) -> usize {
        let mut messages = 1;
        let mut outgoing = initiator.start().unwrap();
        let mut to_responder = true;
        loop {
            let receiver = if to_responder { &mut *responder } else { &mut *initiator };
            match receiver.respond(outgoing).unwrap() {
                None => break,
                Some(next) => {
                    messages += 1;
                    let last = receiver.is_complete() && next.token.is_none();
                    outgoing = next;
                    to_responder = !to_responder;
                    if last {
                        // the final message is still delivered
                        let receiver = if to_responder { &mut *responder } else { &mut *initiator };
                        assert!(receiver.respond(outgoing).unwrap().is_none());
                        break;
                    }
                }
            }
        }
        messages
    }

    #[test]
    fn test_pass_through_pairing() {
        let mut a = HandshakeDriver::new(Box::new(NoSecurity));
        let mut b = HandshakeDriver::new(Box::new(NoSecurity));
        assert_eq!(run_pairing(&mut a, &mut b), 2);
        assert!(a.is_complete() && b.is_complete());
        assert!(a.finish().is_ok());
    }

    #[test]
    fn test_multi_round_pairing_completes_both_sides() {
        let mut a = HandshakeDriver::new(Box::new(CountingSession::default()));
        let mut b = HandshakeDriver::new(Box::new(CountingSession::default()));
        run_pairing(&mut a, &mut b);
        assert!(a.is_complete());
        assert!(b.is_complete());

        let mut sender = a.finish().unwrap();
        let mut listener = b.finish().unwrap();
        let cipher = sender.encrypt(Bytes::from_static(b"hi")).unwrap();
        assert_eq!(listener.decrypt(cipher).unwrap(), Bytes::from_static(b"hi"));
    }

    #[test]
    fn test_unfinished_handshake_is_rejected() {
        let mut driver = HandshakeDriver::new(Box::new(CountingSession::default()));
        driver.start().unwrap();
        assert!(matches!(driver.finish(), Err(TransportError::Security(_))));
    }
}
