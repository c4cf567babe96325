//! Bounded inbound packet queue.
//!
//! The radio driver invokes its receive callback outside the main loop's
//! control flow. The callback's only permitted action is appending to this
//! queue: it never parses payloads, never touches the registry or
//! pairing/OTA state, and never issues a send, because none of those are
//! reentrant-safe against the main loop's use of the same driver.
//!
//! The queue is single-producer (callback) / single-consumer (loop). The
//! producer never blocks: on a full queue the packet is dropped and a
//! counter bumped. The main loop reports the drops from its own context,
//! where logging is safe.

use crate::protocol::constants::INBOUND_QUEUE_CAPACITY;
use crate::radio::RadioAddress;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One queued radio datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Link-level source address, refreshed into the registry on every
    /// message (most-recent-wins).
    pub source: RadioAddress,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Create the inbound queue with the standard capacity.
pub fn inbound_queue() -> (QueueProducer, QueueConsumer) {
    inbound_queue_with_capacity(INBOUND_QUEUE_CAPACITY)
}

/// Create an inbound queue with an explicit capacity (tests).
pub fn inbound_queue_with_capacity(capacity: usize) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = bounded(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        QueueProducer {
            tx,
            dropped: dropped.clone(),
        },
        QueueConsumer {
            rx,
            dropped,
            drops_reported: 0,
        },
    )
}

/// Producer handle for the receive callback.
#[derive(Clone)]
pub struct QueueProducer {
    tx: Sender<QueueEntry>,
    dropped: Arc<AtomicU64>,
}

impl QueueProducer {
    /// Append a datagram. O(1), never blocks, safe to call from the
    /// receive context. On a full queue the packet is silently dropped.
    pub fn enqueue(&self, source: RadioAddress, payload: &[u8]) {
        let entry = QueueEntry {
            source,
            payload: payload.to_vec(),
        };
        if let Err(TrySendError::Full(_)) = self.tx.try_send(entry) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Consumer handle for the main loop.
pub struct QueueConsumer {
    rx: Receiver<QueueEntry>,
    dropped: Arc<AtomicU64>,
    drops_reported: u64,
}

impl QueueConsumer {
    /// Drain every currently queued entry in arrival (FIFO) order.
    pub fn drain_all(&mut self) -> Vec<QueueEntry> {
        let mut entries = Vec::new();
        while let Ok(entry) = self.rx.try_recv() {
            entries.push(entry);
        }
        entries
    }

    /// Total packets dropped on overflow since creation.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drops that occurred since the last call (for periodic reporting).
    pub fn take_new_drops(&mut self) -> u64 {
        let total = self.dropped_total();
        let new = total - self.drops_reported;
        self.drops_reported = total;
        new
    }
}
