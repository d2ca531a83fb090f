//! Bounded per-connection outbound queue with whole-queue overflow disposal.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::handler::DispatchHandler;
use crate::message::Message;

/// Admission ceilings of one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Item ceiling
    pub max_items: usize,
    /// Byte ceiling
    pub max_bytes: usize,
    /// Ceiling for one message
    pub max_message_size: usize,
}

/// A packed packet together with the messages it carries
#[derive(Debug)]
pub struct Batch {
    /// Plain labelled stream
    pub packet: Bytes,
    /// Messages packed into `packet`, in order
    pub messages: Vec<Message>,
}

impl Batch {
    /// Whether the batch carries no message
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Message>,
    bytes: usize,
    parked: Option<Batch>,
    disposed: Option<TransportError>,
}

impl QueueState {
    fn take_all(&mut self) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .parked
            .take()
            .map(|batch| batch.messages)
            .unwrap_or_default();
        messages.extend(self.items.drain(..));
        self.bytes = 0;
        messages
    }
}

/// FIFO of pending messages for one connection
///
/// One lock guards both the counters and the FIFO. Failed messages are
/// always reported after the lock is released.
#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    limits: QueueLimits,
    handler: Arc<dyn DispatchHandler>,
}

impl OutboundQueue {
    /// Create an empty queue
    pub fn new(limits: QueueLimits, handler: Arc<dyn DispatchHandler>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            limits,
            handler,
        }
    }

    /// Admit a message.
    ///
    /// A message above the per-message ceiling is rejected with
    /// `SendTooLarge`. Exceeding the item or byte ceiling rejects the message
    /// with `QueueOverloaded` and disposes the whole queue with the same
    /// error. Rejected messages are dropped; the error is the caller's only
    /// report.
    pub fn enqueue(&self, message: Message) -> Result<()> {
        let size = message.effective_size();
        if size > self.limits.max_message_size {
            return Err(TransportError::SendTooLarge {
                size,
                limit: self.limits.max_message_size,
            });
        }

        let mut state = self.state.lock();
        if let Some(reason) = &state.disposed {
            return Err(reason.clone());
        }

        let items = state.items.len() + 1;
        let bytes = state.bytes + size;
        if items > self.limits.max_items || bytes > self.limits.max_bytes {
            let error = TransportError::QueueOverloaded {
                items: state.items.len(),
                bytes: state.bytes,
            };
            let released = state.take_all();
            state.disposed = Some(error.clone());
            drop(state);

            warn!(
                released = released.len(),
                limit_items = self.limits.max_items,
                limit_bytes = self.limits.max_bytes,
                "outbound queue overloaded, disposing"
            );
            self.release(released, &error);
            return Err(error);
        }

        state.bytes = bytes;
        state.items.push_back(message);
        Ok(())
    }

    /// Pop the oldest live message. Expired messages met on the way are
    /// failed with `SendTimeout`.
    pub fn dequeue(&self) -> Option<Message> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let next = {
            let mut state = self.state.lock();
            loop {
                let Some(message) = state.items.pop_front() else {
                    break None;
                };
                state.bytes -= message.effective_size();
                if message.is_expired(now) {
                    expired.push(message);
                    continue;
                }
                break Some(message);
            }
        };
        self.release(expired, &TransportError::SendTimeout);
        next
    }

    /// Put messages back at the head, keeping their order
    pub fn requeue_front(&self, messages: Vec<Message>) {
        let mut state = self.state.lock();
        if let Some(reason) = state.disposed.clone() {
            drop(state);
            self.release(messages, &reason);
            return;
        }
        for message in messages.into_iter().rev() {
            state.bytes += message.effective_size();
            state.items.push_front(message);
        }
    }

    /// Keep an unacknowledged packet for resending as-is
    pub fn park(&self, batch: Batch) {
        let mut state = self.state.lock();
        if let Some(reason) = state.disposed.clone() {
            drop(state);
            self.release(batch.messages, &reason);
            return;
        }
        debug!(messages = batch.messages.len(), "parking unacknowledged packet");
        state.parked = Some(batch);
    }

    /// Take the parked packet, if any
    pub fn take_parked(&self) -> Option<Batch> {
        self.state.lock().parked.take()
    }

    /// Release every pending message with `reason`. Only the first call has
    /// an effect.
    pub fn dispose(&self, reason: TransportError) -> usize {
        let released = {
            let mut state = self.state.lock();
            if state.disposed.is_some() {
                return 0;
            }
            state.disposed = Some(reason.clone());
            state.take_all()
        };
        let count = released.len();
        if count > 0 {
            debug!(count, %reason, "disposing outbound queue");
        }
        self.release(released, &reason);
        count
    }

    /// Fail every queued message whose deadline passed
    pub fn prune_expired(&self, now: Instant) -> usize {
        let expired: Vec<Message> = {
            let mut state = self.state.lock();
            let (expired, live): (VecDeque<Message>, VecDeque<Message>) =
                state.items.drain(..).partition(|message| message.is_expired(now));
            state.items = live;
            state.bytes = state.items.iter().map(Message::effective_size).sum();
            expired.into()
        };
        let count = expired.len();
        self.release(expired, &TransportError::SendTimeout);
        count
    }

    /// Queued items, including a parked packet's messages
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.items.len() + state.parked.as_ref().map_or(0, |batch| batch.messages.len())
    }

    /// Whether nothing waits to be sent
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued bytes, excluding a parked packet
    pub fn bytes(&self) -> usize {
        self.state.lock().bytes
    }

    /// Disposal reason, if disposed
    pub fn disposed(&self) -> Option<TransportError> {
        self.state.lock().disposed.clone()
    }

    /// Report a failure for messages that left the queue
    pub fn release(&self, messages: Vec<Message>, reason: &TransportError) {
        for message in messages {
            message.fail(reason.clone(), self.handler.as_ref());
        }
    }

    /// Handler receiving failures of this queue
    pub fn handler(&self) -> &Arc<dyn DispatchHandler> {
        &self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::tests::RecordingHandler;
    use crate::message::ConnectionKey;
    use std::time::Duration;
    use tunnel_wire::FramedBuffer;

    fn limits() -> QueueLimits {
        QueueLimits {
            max_items: 4,
            max_bytes: 100,
            max_message_size: 60,
        }
    }

    fn message(id: u64, size: usize, ttl: Duration) -> Message {
        let mut message = Message::new(ConnectionKey::persistent("tcp://a:1"), FramedBuffer::from_bytes(vec![0u8; size]));
        message.prepare(id, Instant::now() + ttl);
        message
    }

    #[tokio::test]
    async fn test_fifo_and_counters() {
        let queue = OutboundQueue::new(limits(), Arc::new(RecordingHandler::default()));
        for id in 1..=3 {
            queue.enqueue(message(id, 10, Duration::from_secs(5))).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.bytes(), 30);

        let ids: Vec<u64> = std::iter::from_fn(|| queue.dequeue()).map(|m| m.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(queue.bytes(), 0);
    }

    #[tokio::test]
    async fn test_too_large_leaves_queue_alone() {
        let handler = Arc::new(RecordingHandler::default());
        let queue = OutboundQueue::new(limits(), handler.clone());
        queue.enqueue(message(1, 10, Duration::from_secs(5))).unwrap();

        let err = queue.enqueue(message(2, 61, Duration::from_secs(5))).unwrap_err();
        assert!(matches!(err, TransportError::SendTooLarge { size: 61, limit: 60 }));
        assert_eq!(queue.len(), 1);
        assert!(handler.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn test_byte_overflow_disposes_every_queued_message() {
        let handler = Arc::new(RecordingHandler::default());
        let queue = OutboundQueue::new(limits(), handler.clone());
        queue.enqueue(message(1, 50, Duration::from_secs(5))).unwrap();
        queue.enqueue(message(2, 40, Duration::from_secs(5))).unwrap();

        let err = queue.enqueue(message(3, 20, Duration::from_secs(5))).unwrap_err();
        assert!(matches!(err, TransportError::QueueOverloaded { items: 2, bytes: 90 }));
        assert!(queue.is_empty());

        let failures = handler.failures.lock();
        let ids: Vec<u64> = failures.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(failures.iter().all(|(_, e)| e.contains("overloaded")));
        drop(failures);

        // the rejected message is not reported twice, later admissions fail
        assert!(queue.enqueue(message(4, 1, Duration::from_secs(5))).is_err());
        assert_eq!(handler.failures.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_item_overflow() {
        let queue = OutboundQueue::new(limits(), Arc::new(RecordingHandler::default()));
        for id in 1..=4 {
            queue.enqueue(message(id, 1, Duration::from_secs(5))).unwrap();
        }
        assert!(matches!(
            queue.enqueue(message(5, 1, Duration::from_secs(5))),
            Err(TransportError::QueueOverloaded { items: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let handler = Arc::new(RecordingHandler::default());
        let queue = OutboundQueue::new(limits(), handler.clone());
        queue.enqueue(message(1, 1, Duration::from_secs(5))).unwrap();

        assert_eq!(queue.dispose(TransportError::ClosedManually), 1);
        assert_eq!(queue.dispose(TransportError::Shutdown), 0);
        assert!(matches!(queue.disposed(), Some(TransportError::ClosedManually)));
        assert_eq!(handler.failures.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_skips_expired() {
        let handler = Arc::new(RecordingHandler::default());
        let queue = OutboundQueue::new(limits(), handler.clone());
        queue.enqueue(message(1, 1, Duration::from_millis(10))).unwrap();
        queue.enqueue(message(2, 1, Duration::from_secs(10))).unwrap();

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(queue.dequeue().map(|m| m.id()), Some(2));
        assert_eq!(handler.failures.lock()[0].0, 1);
    }

    #[tokio::test]
    async fn test_requeue_and_park_keep_order() {
        let queue = OutboundQueue::new(limits(), Arc::new(RecordingHandler::default()));
        queue.enqueue(message(3, 1, Duration::from_secs(5))).unwrap();
        queue.requeue_front(vec![message(1, 1, Duration::from_secs(5)), message(2, 1, Duration::from_secs(5))]);

        let ids: Vec<u64> = std::iter::from_fn(|| queue.dequeue()).map(|m| m.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        queue.park(Batch {
            packet: Bytes::from_static(b"\x00"),
            messages: vec![message(9, 1, Duration::from_secs(5))],
        });
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take_parked().map(|b| b.messages.len()), Some(1));
        assert!(queue.is_empty());
    }
}
