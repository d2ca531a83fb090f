//! Periodic sweep over the connection pool.

use std::sync::Arc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::manager::{ConnectionManager, Record};
use crate::transport::Connector;

impl<K: Connector> ConnectionManager<K> {
    pub(crate) fn spawn_housekeeping(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.housekeeping_interval;
        let mut shutdown = self.inner.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ConnectionManager { inner }.sweep(Instant::now());
            }
            debug!("housekeeping stopped");
        });
    }

    /// One housekeeping pass: expire queued messages, ping idle long-lived
    /// connections, close inactive and overdue ones, release idle peers
    pub(crate) fn sweep(&self, now: Instant) {
        let records: Vec<Arc<Record<K>>> = self.inner.pool.iter().map(|entry| entry.value().clone()).collect();
        let config = &self.inner.config;

        for record in records {
            let expired = record.queue().prune_expired(now);
            if expired > 0 {
                debug!(connection = %record.key(), expired, "expired queued messages");
            }
            if record.is_stub() || !record.is_valid() {
                continue;
            }

            let kind = record.key().kind;
            if !kind.is_long_lived() {
                if now.saturating_duration_since(record.created()) >= config.invocation_timeout {
                    let reason = if kind.expects_reply() {
                        TransportError::ServerDidNotReply
                    } else {
                        TransportError::SendTimeout
                    };
                    debug!(connection = %record.key(), "closing overdue exchange");
                    self.close_record(&record, reason);
                }
                continue;
            }

            if let Some(limit) = config.close_after_inactivity {
                if record.inactive_for(now) >= limit && record.queue().is_empty() {
                    info!(connection = %record.key(), idle = ?limit, "closing inactive connection");
                    self.close_record(&record, TransportError::ClosedManually);
                    continue;
                }
            }

            if !record.queue().is_empty() {
                self.pump(&record);
            } else if record.idle_sending(now) >= config.ping_interval {
                self.ping(&record);
            }
        }

        for peer in self.inner.peers.expired(now) {
            self.release_peer_if_idle(peer.uri());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::manager::tests::{test_config, wait_until, CollectingHandler, PEER};
    use crate::manager::ConnectionEvent;
    use crate::message::{ConnectionKey, Message};
    use crate::security::NoSecurityFactory;
    use crate::transport::mock::{MockConnector, MockState};
    use std::time::Duration;
    use tunnel_wire::labelled::STREAM_END;
    use tunnel_wire::FramedBuffer;

    fn setup(config: TransportConfig) -> (ConnectionManager<MockConnector>, Arc<MockState>) {
        let connector = MockConnector::new();
        let state = connector.state.clone();
        let manager = ConnectionManager::new(
            config,
            "tcp://local:7000",
            connector,
            Arc::new(CollectingHandler::default()),
            Arc::new(NoSecurityFactory),
        )
        .unwrap();
        (manager, state)
    }

    async fn open(manager: &ConnectionManager<MockConnector>) {
        manager
            .send(Message::new(ConnectionKey::persistent(PEER), FramedBuffer::from_bytes(&b"hello"[..])).synchronous(true))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_is_pinged() {
        let config = TransportConfig {
            ping_interval: Duration::from_secs(5),
            ..test_config()
        };
        let (manager, state) = setup(config);
        open(&manager).await;

        manager.sweep(Instant::now());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state.sent.lock().len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        manager.sweep(Instant::now());
        wait_until(|| state.sent.lock().len() == 2).await;
        assert_eq!(state.sent.lock()[1].as_ref(), &[STREAM_END]);
        // pings are not activity
        assert_eq!(manager.snapshot()[0].stats.messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_connection_is_closed() {
        let config = TransportConfig {
            ping_interval: Duration::from_secs(1),
            close_after_inactivity: Some(Duration::from_secs(30)),
            ..test_config()
        };
        let (manager, _) = setup(config);
        let mut events = manager.subscribe();
        open(&manager).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        manager.sweep(Instant::now());
        assert!(manager.snapshot().is_empty());
        loop {
            if let ConnectionEvent::Closed { reason, .. } = events.recv().await.unwrap() {
                assert!(matches!(reason, TransportError::ClosedManually));
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_close_can_be_disabled() {
        let config = TransportConfig {
            close_after_inactivity: None,
            ..test_config()
        };
        let (manager, _) = setup(config);
        open(&manager).await;

        tokio::time::advance(Duration::from_secs(24 * 3600)).await;
        manager.sweep(Instant::now());
        assert_eq!(manager.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_idle_peer_is_released() {
        let config = TransportConfig {
            peer_lease: Duration::from_secs(10),
            ..test_config()
        };
        let (manager, _) = setup(config);
        open(&manager).await;
        manager.release(&ConnectionKey::persistent(PEER));
        assert!(manager.peers().get(PEER).is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        manager.sweep(Instant::now());
        assert!(manager.peers().get(PEER).is_none());
    }
}
