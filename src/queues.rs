//! The three bounded MPSC queue families of spec §4.5: `cmd_queue`
//! (API boundary to worker), `op_queue` (worker to consumer), and
//! `writer_queue` (consumer to writer).
//!
//! Grounded on `txpipe-dolos`'s gasket-stage channel wiring, replaced here
//! with plain `crossbeam-channel` bounded rings per spec §9's
//! "ad-hoc queues with libuv worker threads -> bounded MPSC channels"
//! redesign note. Capacities are validated as powers of two at
//! [`crate::config::Config`] construction time; these wrappers assume
//! that invariant already holds.

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};

use tagbase_core::{Op, QueueError, ValidatedCommand, WriterEntry};

/// A validated command in transit from the API boundary to a worker.
pub type CmdMsg = ValidatedCommand;

/// A single per-key mutation in transit from a worker to a consumer.
pub type OpMsg = Op;

/// A bounded sender that turns an exceeded-capacity send into
/// [`QueueError::Full`] instead of blocking, so producers can apply their
/// own backoff policy (spec §4.5: "enqueue on full returns `FULL` and
/// producers backoff").
#[derive(Clone)]
pub struct BoundedSender<T>(Sender<T>);

impl<T> BoundedSender<T> {
    pub fn try_send(&self, value: T) -> Result<(), QueueError> {
        match self.0.try_send(value) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(QueueError::Full),
            Err(TrySendError::Disconnected(_)) => Err(QueueError::Closed),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// A bounded receiver exposing both a non-blocking drain (used by
/// workers/consumers/writer batch loops) and a blocking recv with timeout
/// (used when a stage has nothing else to do but wait).
pub struct BoundedReceiver<T>(Receiver<T>);

impl<T> BoundedReceiver<T> {
    /// Drains up to `max` pending items without blocking (spec §4.6/§4.7/
    /// §4.8's `MAX_BATCH`/`MAX_DEQUEUE` batch drain).
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(max.min(64));
        for _ in 0..max {
            match self.0.try_recv() {
                Ok(item) => out.push(item),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<T> {
        self.0.recv_timeout(timeout).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Shared by the three named queue constructors below and by
/// [`crate::engine::Engine`] for the request/response envelope it sends
/// over its own `cmd_queue`.
pub(crate) fn bounded_pair<T>(capacity: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (BoundedSender(tx), BoundedReceiver(rx))
}

/// One `cmd_queue` per worker.
pub fn cmd_queue(capacity: usize) -> (BoundedSender<CmdMsg>, BoundedReceiver<CmdMsg>) {
    bounded_pair(capacity)
}

/// One `op_queue` per (consumer, local-queue-index) pair.
pub fn op_queue(capacity: usize) -> (BoundedSender<OpMsg>, BoundedReceiver<OpMsg>) {
    bounded_pair(capacity)
}

/// The single shared `writer_queue`.
pub fn writer_queue(capacity: usize) -> (BoundedSender<WriterEntry>, BoundedReceiver<WriterEntry>) {
    bounded_pair(capacity)
}

/// Fan-out routing for `op_queue`s: `hash(ser_db_key) & (total - 1)`
///, split further into `(consumer_index, local_queue_index)`
/// so each consumer can own a contiguous slice of queues.
pub fn route_op(ser_db_key: &str, num_consumers: usize, queues_per_consumer: usize) -> (usize, usize) {
    let total = num_consumers * queues_per_consumer;
    let slot = (xxhash_rust::xxh3::xxh3_64(ser_db_key.as_bytes()) as usize) & (total - 1);
    (slot / queues_per_consumer, slot % queues_per_consumer)
}

/// `hash(affinity_key) & (num_workers - 1)` routing for `cmd_queue`s
/// (spec §4.5: "producers route by hash of an affinity key").
pub fn route_cmd(affinity_key: &str, num_workers: usize) -> usize {
    (xxhash_rust::xxh3::xxh3_64(affinity_key.as_bytes()) as usize) & (num_workers - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_send_reports_full_without_blocking() {
        let (tx, _rx) = bounded_pair::<u32>(1);
        tx.try_send(1).unwrap();
        assert!(matches!(tx.try_send(2), Err(QueueError::Full)));
    }

    #[test]
    fn drain_stops_at_capacity_or_empty() {
        let (tx, rx) = bounded_pair::<u32>(4);
        for v in 0..3 {
            tx.try_send(v).unwrap();
        }
        let drained = rx.drain(2);
        assert_eq!(drained, vec![0, 1]);
        let rest = rx.drain(10);
        assert_eq!(rest, vec![2]);
    }

    #[test]
    fn route_op_is_deterministic_and_within_range() {
        let (c, q) = route_op("metrics|inverted_event_index_db|loc:ca", 4, 2);
        assert!(c < 4);
        assert!(q < 2);
        assert_eq!(route_op("metrics|inverted_event_index_db|loc:ca", 4, 2), (c, q));
    }

    #[test]
    fn route_cmd_stays_in_worker_range() {
        for key in ["conn-1", "conn-2", "conn-3"] {
            assert!(route_cmd(key, 8) < 8);
        }
    }
}
