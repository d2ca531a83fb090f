//! Remote peers and the registry that leases them.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use tunnel_wire::WIRE_VERSION;

/// A remote endpoint
#[derive(Debug)]
pub struct Peer {
    uri: String,
    address: Mutex<Option<SocketAddr>>,
    protocol_version: AtomicU8,
    host_id: Mutex<Option<i32>>,
    lease_deadline: Mutex<Instant>,
}

impl Peer {
    fn new(uri: String, lease: Duration) -> Self {
        Self {
            uri,
            address: Mutex::new(None),
            protocol_version: AtomicU8::new(WIRE_VERSION),
            host_id: Mutex::new(None),
            lease_deadline: Mutex::new(Instant::now() + lease),
        }
    }

    /// Stable logical identifier
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Last resolved physical address
    pub fn address(&self) -> Option<SocketAddr> {
        *self.address.lock()
    }

    /// Record the physical address used by the latest connection
    pub fn set_address(&self, addr: SocketAddr) {
        *self.address.lock() = Some(addr);
    }

    /// Protocol version negotiated with this peer
    pub fn protocol_version(&self) -> u8 {
        self.protocol_version.load(Ordering::Acquire)
    }

    /// Record the negotiated protocol version
    pub fn set_protocol_version(&self, version: u8) {
        self.protocol_version.store(version, Ordering::Release);
    }

    /// Host incarnation identifier seen on the latest establishment
    pub fn host_id(&self) -> Option<i32> {
        *self.host_id.lock()
    }

    /// Extend the lease to `lease` from now
    pub fn renew(&self, lease: Duration) {
        *self.lease_deadline.lock() = Instant::now() + lease;
    }

    /// Whether the lease ran out at `now`
    pub fn lease_expired(&self, now: Instant) -> bool {
        *self.lease_deadline.lock() <= now
    }
}

/// Outcome of comparing a host id announced by a peer with the known one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostObservation {
    /// No host id was known yet
    First,
    /// Same incarnation as before
    Same,
    /// The peer process restarted
    Restarted {
        /// Host id of the previous incarnation
        previous: i32,
    },
}

/// Registry of known peers keyed by URI
#[derive(Debug)]
pub struct PeerRegistry {
    peers: DashMap<String, Arc<Peer>>,
    lease: Duration,
}

impl PeerRegistry {
    /// Create a registry granting `lease` on every contact
    pub fn new(lease: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            lease,
        }
    }

    /// Look up or register a peer and renew its lease
    pub fn resolve(&self, uri: &str) -> Arc<Peer> {
        let peer = self
            .peers
            .entry(uri.to_string())
            .or_insert_with(|| {
                debug!(peer = uri, "registering peer");
                Arc::new(Peer::new(uri.to_string(), self.lease))
            })
            .clone();
        peer.renew(self.lease);
        peer
    }

    /// Look up a peer without registering it
    pub fn get(&self, uri: &str) -> Option<Arc<Peer>> {
        self.peers.get(uri).map(|entry| entry.clone())
    }

    /// Record the host id announced on an establishment
    pub fn observe_host(&self, peer: &Peer, host_id: i32) -> HostObservation {
        let mut known = peer.host_id.lock();
        let observation = match *known {
            None => HostObservation::First,
            Some(previous) if previous == host_id => HostObservation::Same,
            Some(previous) => {
                info!(peer = peer.uri(), previous, current = host_id, "peer restarted");
                HostObservation::Restarted { previous }
            }
        };
        *known = Some(host_id);
        observation
    }

    /// Forget a peer
    pub fn release(&self, uri: &str) -> bool {
        let removed = self.peers.remove(uri).is_some();
        if removed {
            debug!(peer = uri, "peer released");
        }
        removed
    }

    /// Peers whose lease ran out at `now`
    pub fn expired(&self, now: Instant) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|entry| entry.lease_expired(now))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is known
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry() {
        let registry = PeerRegistry::new(Duration::from_secs(10));
        let peer = registry.resolve("tcp://a:1");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(registry.expired(Instant::now()).is_empty());

        registry.resolve("tcp://a:1");
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!peer.lease_expired(Instant::now()));

        tokio::time::advance(Duration::from_secs(2)).await;
        let expired = registry.expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].uri(), "tcp://a:1");
    }

    #[test]
    fn test_restart_detection() {
        let registry = PeerRegistry::new(Duration::from_secs(60));
        let peer = registry.resolve("http://b/tunnel");

        assert_eq!(registry.observe_host(&peer, 7), HostObservation::First);
        assert_eq!(registry.observe_host(&peer, 7), HostObservation::Same);
        assert_eq!(
            registry.observe_host(&peer, 8),
            HostObservation::Restarted { previous: 7 }
        );
        assert_eq!(peer.host_id(), Some(8));
    }

    #[test]
    fn test_resolve_is_shared() {
        let registry = PeerRegistry::new(Duration::from_secs(60));
        let a = registry.resolve("tcp://c:1");
        let b = registry.resolve("tcp://c:1");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.release("tcp://c:1"));
        assert!(registry.is_empty());
    }
}
