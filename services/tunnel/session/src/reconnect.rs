//! Reconnection engine.
//!
//! A failed long-lived record is replaced by a stub that keeps the outbound
//! queue and holds the send lock. Records this side dialled are redialled up
//! to `reconnect_max_tries` times within `reconnect_deadline`; records the
//! peer opened wait for the peer to come back. On success the new record
//! adopts the queue and resumes draining; on exhaustion the queue is
//! disposed with `ReconnectFailed`.

use std::sync::Arc;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{ErrorClass, TransportError};
use crate::manager::{ConnectionEvent, ConnectionManager, Record};
use crate::record::{ConnectionRecord, Origin, RecordParts};
use crate::transport::{Channel, Connector};

enum Attempt<K: Connector> {
    /// A new record is in the slot
    Replaced(Arc<Record<K>>),
    /// The stub left the slot without us: closed, or the peer reconnected
    Superseded,
}

impl<K: Connector> ConnectionManager<K> {
    /// Begin reestablishing `failed`; a reconnection already running for it
    /// only records the additional failure
    pub(crate) fn start_reconnect(&self, failed: Arc<Record<K>>, cause: TransportError) {
        if !failed.begin_reconnect() {
            debug!(connection = %failed.key(), %cause, "reconnection already running");
            return;
        }

        let key = failed.key().clone();
        let stub = Arc::new(ConnectionRecord::stub(&failed, self.inner.record_ids.next_id()));
        let installed = match self.inner.pool.get_mut(&key) {
            Some(mut slot) if Arc::ptr_eq(slot.value(), &failed) => {
                *slot.value_mut() = stub.clone();
                true
            }
            _ => false,
        };

        failed.invalidate();
        if let Some(channel) = failed.channel() {
            channel.close(&cause);
        }

        if !installed {
            // the slot moved on while we failed; keep the queue only if
            // someone adopted it
            if !failed.is_handed_off() {
                failed.queue().dispose(cause);
            }
            return;
        }

        warn!(connection = %key, record = failed.id(), %cause, "connection failed, reestablishing");
        self.emit(ConnectionEvent::Reestablishing {
            key,
            cause: cause.clone(),
        });

        let this = self.clone();
        tokio::spawn(async move { this.reconnect(failed, stub, cause).await });
    }

    async fn reconnect(self, failed: Arc<Record<K>>, stub: Arc<Record<K>>, cause: TransportError) {
        let deadline = Instant::now() + self.inner.config.reconnect_deadline;
        let outcome = match failed.origin() {
            Origin::Outbound => self.redial(&stub, deadline).await,
            Origin::Inbound => self.await_peer(&stub, deadline).await,
        };

        match outcome {
            Ok(Attempt::Replaced(record)) => {
                info!(connection = %record.key(), record = record.id(), "connection reestablished");
                self.emit(ConnectionEvent::Reestablished {
                    key: record.key().clone(),
                });
                if failed.take_retry_request() {
                    debug!(connection = %record.key(), "failures reported during reconnection were absorbed");
                }
                self.spawn_receiver(record.clone());
                self.drain(record.clone()).await;
                // senders that found the stub just before the swap
                if !record.queue().is_empty() {
                    self.pump(&record);
                }
            }
            Ok(Attempt::Superseded) => {
                debug!(connection = %stub.key(), "reconnection superseded");
            }
            Err(tries) => self.give_up(&stub, tries, cause),
        }
    }

    /// Dial again until a connection is up, the tries or the deadline run
    /// out, or the stub leaves the slot
    async fn redial(&self, stub: &Arc<Record<K>>, deadline: Instant) -> Result<Attempt<K>, u32> {
        let config = self.inner.config.clone();
        let key = stub.key().clone();
        let mut tries = 0;

        while tries < config.reconnect_max_tries && Instant::now() < deadline {
            if tries > 0 {
                sleep_until((Instant::now() + config.reconnect_interval).min(deadline)).await;
            }
            if !self.holds(stub) || self.is_shut_down() {
                return Ok(Attempt::Superseded);
            }
            tries += 1;

            let request = self.connect_request(&key, stub.peer(), stub.wire_id(), stub.sequences().clone(), false);
            let bound = (Instant::now() + config.connect_timeout).min(deadline);
            let established = match timeout_at(bound, self.inner.connector.connect(request)).await {
                Ok(Ok(established)) => established,
                Ok(Err(error)) => {
                    warn!(connection = %key, attempt = tries, %error, "reconnection attempt failed");
                    if error.class() == ErrorClass::Critical {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    warn!(connection = %key, attempt = tries, "reconnection attempt timed out");
                    continue;
                }
            };

            self.observe_remote(stub.peer(), established.remote.host_id, &key);
            let record = Arc::new(ConnectionRecord::live(RecordParts {
                id: self.inner.record_ids.next_id(),
                key: key.clone(),
                peer: stub.peer().clone(),
                origin: Origin::Outbound,
                wire_id: stub.wire_id(),
                queue: stub.queue().clone(),
                sequences: stub.sequences().clone(),
                channel: established.channel,
                sender_session: established.sender_session,
                listener_session: established.listener_session,
                remote_host_id: established.remote.host_id,
                send_lock_held: true,
            }));

            let swapped = match self.inner.pool.get_mut(&key) {
                Some(mut slot) if Arc::ptr_eq(slot.value(), stub) && stub.is_valid() => {
                    *slot.value_mut() = record.clone();
                    true
                }
                _ => false,
            };
            if !swapped {
                if let Some(channel) = record.channel() {
                    channel.close(&TransportError::ClosedManually);
                }
                return Ok(Attempt::Superseded);
            }
            stub.invalidate();
            return Ok(Attempt::Replaced(record));
        }
        Err(tries)
    }

    /// Wait for the peer to open the connection again; `accept` does the swap
    async fn await_peer(&self, stub: &Arc<Record<K>>, deadline: Instant) -> Result<Attempt<K>, u32> {
        debug!(connection = %stub.key(), "waiting for the peer to reconnect");
        match timeout_at(deadline, stub.accepted()).await {
            Ok(()) => Ok(Attempt::Superseded),
            Err(_) if !self.holds(stub) => Ok(Attempt::Superseded),
            Err(_) => Err(0),
        }
    }

    fn holds(&self, stub: &Arc<Record<K>>) -> bool {
        stub.is_valid()
            && self
                .inner
                .pool
                .get(stub.key())
                .is_some_and(|slot| Arc::ptr_eq(slot.value(), stub))
    }

    fn give_up(&self, stub: &Arc<Record<K>>, tries: u32, cause: TransportError) {
        if !stub.invalidate() {
            return;
        }
        let reason = TransportError::ReconnectFailed {
            tries,
            cause: Box::new(cause),
        };
        let key = stub.key().clone();
        error!(connection = %key, tries, %reason, "giving up on connection");

        self.inner
            .pool
            .remove_if(&key, |_, current| Arc::ptr_eq(current, stub));
        stub.queue().dispose(reason.clone());
        self.emit(ConnectionEvent::Closed {
            key: key.clone(),
            reason,
        });
        self.release_peer_if_idle(&key.peer);
    }
}
