//! Sequenced message queue with retry and replay support.
//!
//! Every outbound message passes through the queue: `enqueue` assigns the
//! next sequence number and appends to the pending list; `dequeue` hands the
//! head to the writer and moves it into the in-flight map; `ack` clears it.
//! In-flight messages that age past the retry timeout are returned by
//! `check_retries` for resend (with their original sequence numbers) until
//! the retry cap, after which they are dropped silently.
//!
//! The queue is not a concurrency primitive: one internal mutex protects the
//! maps, and the session runtime coordinates its pumps around it. Time is
//! passed in explicitly so retry behavior is testable without sleeping.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::constants::{MAX_QUEUE_SIZE, MAX_RETRIES, RETRY_TIMEOUT};
use crate::protocol::Message;

/// Queue tuning knobs; defaults match the protocol constants.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Pending capacity; the oldest pending message is evicted on overflow.
    pub capacity: usize,
    /// Resend attempts before an unacked message is dropped.
    pub max_retries: u32,
    /// Age at which an in-flight message becomes due for resend.
    pub retry_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_QUEUE_SIZE,
            max_retries: MAX_RETRIES,
            retry_timeout: RETRY_TIMEOUT,
        }
    }
}

/// A message paired with its send timestamp and retry counter.
#[derive(Debug)]
struct QueueItem {
    message: Message,
    sent_at: Instant,
    retries: u32,
}

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<QueueItem>,
    in_flight: HashMap<String, QueueItem>,
    seq: u64,
}

/// Per-connection FIFO pending list plus in-flight map.
#[derive(Debug)]
pub struct MessageQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
}

impl MessageQueue {
    /// Create a queue with the given configuration.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Assign the next sequence number and append to pending.
    ///
    /// Returns the assigned sequence number. On overflow the oldest pending
    /// message is evicted.
    pub fn enqueue(&self, mut msg: Message) -> u64 {
        let mut inner = self.inner.lock().unwrap();

        if inner.pending.len() >= self.config.capacity {
            if let Some(evicted) = inner.pending.pop_front() {
                warn!(seq = evicted.message.seq, "queue full, evicting oldest pending");
            }
        }

        inner.seq += 1;
        msg.seq = inner.seq;
        let seq = msg.seq;

        inner.pending.push_back(QueueItem {
            message: msg,
            sent_at: Instant::now(),
            retries: 0,
        });

        seq
    }

    /// Pop the head of pending and move it into in-flight.
    ///
    /// The send timestamp is refreshed here: retry aging starts when the
    /// writer takes the message, not when it was produced.
    pub fn dequeue(&self) -> Option<Message> {
        let mut inner = self.inner.lock().unwrap();

        let mut item = inner.pending.pop_front()?;
        item.sent_at = Instant::now();
        let msg = item.message.clone();
        inner.in_flight.insert(msg.id.clone(), item);

        Some(msg)
    }

    /// Remove an acked message from in-flight. Idempotent; unknown ids are a
    /// no-op.
    pub fn ack(&self, message_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight.remove(message_id);
    }

    /// Scan in-flight for messages due for resend at `now`.
    ///
    /// Each due message gets its retry counter bumped and timer reset; past
    /// the cap it is dropped silently. Returned messages carry their original
    /// sequence numbers and updated retry counts.
    pub fn check_retries(&self, now: Instant) -> Vec<Message> {
        let mut inner = self.inner.lock().unwrap();
        let mut due = Vec::new();
        let mut expired = Vec::new();

        for (id, item) in inner.in_flight.iter_mut() {
            if now.saturating_duration_since(item.sent_at) <= self.config.retry_timeout {
                continue;
            }
            if item.retries < self.config.max_retries {
                item.retries += 1;
                item.sent_at = now;
                item.message.retry_count = item.retries;
                due.push(item.message.clone());
            } else {
                expired.push(id.clone());
            }
        }

        for id in expired {
            inner.in_flight.remove(&id);
        }

        due.sort_by_key(|m| m.seq);
        due
    }

    /// All pending and in-flight messages with sequence greater than `seq`,
    /// in sequence order. Used for replay after reconnect.
    pub fn messages_after(&self, seq: u64) -> Vec<Message> {
        let inner = self.inner.lock().unwrap();

        let mut msgs: Vec<Message> = inner
            .pending
            .iter()
            .chain(inner.in_flight.values())
            .filter(|item| item.message.seq > seq)
            .map(|item| item.message.clone())
            .collect();

        msgs.sort_by_key(|m| m.seq);
        msgs
    }

    /// Number of messages waiting for the writer.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Number of messages sent but not yet acked.
    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().unwrap().in_flight.len()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Body, PingPayload};

    fn ping() -> Message {
        Message::new(Body::Ping(PingPayload::default()))
    }

    fn queue_with(retry_timeout: Duration) -> MessageQueue {
        MessageQueue::new(QueueConfig {
            capacity: 8,
            max_retries: 3,
            retry_timeout,
        })
    }

    #[test]
    fn enqueue_assigns_increasing_gap_free_sequences() {
        let q = MessageQueue::default();
        for expected in 1..=5u64 {
            assert_eq!(q.enqueue(ping()), expected);
        }
    }

    #[test]
    fn dequeue_moves_to_in_flight() {
        let q = MessageQueue::default();
        q.enqueue(ping());
        assert_eq!(q.pending_len(), 1);
        assert_eq!(q.in_flight_len(), 0);

        let msg = q.dequeue().unwrap();
        assert_eq!(msg.seq, 1);
        assert_eq!(q.pending_len(), 0);
        assert_eq!(q.in_flight_len(), 1);

        assert!(q.dequeue().is_none());
    }

    #[test]
    fn ack_is_idempotent_and_tolerates_unknown_ids() {
        let q = MessageQueue::default();
        q.enqueue(ping());
        let msg = q.dequeue().unwrap();

        q.ack(&msg.id);
        assert_eq!(q.in_flight_len(), 0);

        // Second ack and unknown id are no-ops.
        q.ack(&msg.id);
        q.ack("no-such-id");
        assert_eq!(q.in_flight_len(), 0);
    }

    #[test]
    fn overflow_evicts_oldest_pending() {
        let q = MessageQueue::new(QueueConfig {
            capacity: 3,
            ..Default::default()
        });
        for _ in 0..5 {
            q.enqueue(ping());
        }

        assert_eq!(q.pending_len(), 3);
        // Oldest two (seq 1, 2) were evicted.
        assert_eq!(q.dequeue().unwrap().seq, 3);
    }

    #[test]
    fn retries_fire_after_timeout_and_reset_the_timer() {
        let q = queue_with(Duration::from_millis(50));
        q.enqueue(ping());
        let msg = q.dequeue().unwrap();

        let now = Instant::now();
        assert!(q.check_retries(now).is_empty());

        let later = now + Duration::from_millis(60);
        let due = q.check_retries(later);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, msg.id);
        assert_eq!(due[0].seq, msg.seq);
        assert_eq!(due[0].retry_count, 1);

        // Timer was reset; not due again immediately.
        assert!(q.check_retries(later).is_empty());
    }

    #[test]
    fn retry_cap_drops_silently() {
        let q = queue_with(Duration::from_millis(10));
        q.enqueue(ping());
        q.dequeue().unwrap();

        let mut now = Instant::now();
        for attempt in 1..=3u32 {
            now += Duration::from_millis(20);
            let due = q.check_retries(now);
            assert_eq!(due.len(), 1, "attempt {} should resend", attempt);
            assert_eq!(due[0].retry_count, attempt);
        }

        // Fourth window: dropped, nothing returned, in-flight emptied.
        now += Duration::from_millis(20);
        assert!(q.check_retries(now).is_empty());
        assert_eq!(q.in_flight_len(), 0);

        // And it stays gone.
        now += Duration::from_millis(20);
        assert!(q.check_retries(now).is_empty());
    }

    #[test]
    fn messages_after_spans_pending_and_in_flight_in_order() {
        let q = MessageQueue::default();
        for _ in 0..5 {
            q.enqueue(ping());
        }
        // seq 1 and 2 sent (and seq 1 acked), 3..5 still pending.
        let first = q.dequeue().unwrap();
        q.dequeue().unwrap();
        q.ack(&first.id);

        let replay = q.messages_after(2);
        let seqs: Vec<u64> = replay.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        // seq 2 is unacked in-flight; a client that saw only seq 1 gets it.
        let replay = q.messages_after(1);
        let seqs: Vec<u64> = replay.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4, 5]);
    }

    #[test]
    fn messages_after_high_watermark_is_empty() {
        let q = MessageQueue::default();
        q.enqueue(ping());
        q.enqueue(ping());
        assert!(q.messages_after(99).is_empty());
    }
}
