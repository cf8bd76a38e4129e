//! Bounded hand-off between the chain scanners and the analytics consumer.
//!
//! Producers await when the queue is full, so a slow consumer throttles
//! scanning instead of dropping events. The consumer wakes at least once a
//! second even when nothing arrives, so it can notice shutdown.

use crate::onchain::types::BlockchainEvent;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub const DEFAULT_CAPACITY: usize = 10_000;

/// How long `next` waits before reporting `Idle`.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("ingest queue closed")]
pub struct QueueClosed;

/// Producer handle. Cheap to clone, one per scanner.
#[derive(Debug, Clone)]
pub struct IngestSender {
    tx: mpsc::Sender<BlockchainEvent>,
}

impl IngestSender {
    /// Enqueue an event, waiting for room if the queue is full.
    pub async fn push(&self, event: BlockchainEvent) -> Result<(), QueueClosed> {
        self.tx.send(event).await.map_err(|_| QueueClosed)
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }

    pub fn max_capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// What the consumer got from one `next` call.
#[derive(Debug)]
pub enum Received {
    Event(BlockchainEvent),
    /// Nothing arrived within the idle timeout.
    Idle,
    /// Every sender is gone and the queue is drained.
    Closed,
}

#[derive(Debug)]
pub struct IngestReceiver {
    rx: mpsc::Receiver<BlockchainEvent>,
    idle_timeout: Duration,
}

impl IngestReceiver {
    pub async fn next(&mut self) -> Received {
        match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
            Ok(Some(event)) => Received::Event(event),
            Ok(None) => Received::Closed,
            Err(_) => Received::Idle,
        }
    }

    /// Take whatever is already queued without waiting.
    pub fn drain(&mut self) -> Vec<BlockchainEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a queue holding at most `capacity` events (minimum 1).
pub fn ingest_queue(capacity: usize) -> (IngestSender, IngestReceiver) {
    ingest_queue_with_idle(capacity, IDLE_TIMEOUT)
}

pub fn ingest_queue_with_idle(
    capacity: usize,
    idle_timeout: Duration,
) -> (IngestSender, IngestReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IngestSender { tx }, IngestReceiver { rx, idle_timeout })
}
