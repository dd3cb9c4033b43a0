//! Capacity-bounded FIFO queue with completion and cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::MigrateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue operation cancelled")]
    Cancelled,
    #[error("queue is complete")]
    Completed,
}

impl From<QueueError> for MigrateError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Cancelled => MigrateError::Cancelled,
            QueueError::Completed => {
                MigrateError::transfer("pipeline", "put on a queue that was already completed")
            }
        }
    }
}

/// A bounded queue shared by producers and consumers.
///
/// `put` waits while the queue is full and `take` waits while it is empty.
/// [`complete`](Self::complete) is one-way and idempotent: later puts fail,
/// but queued items still drain. Cancelling the token wakes every waiter.
pub struct BoundedQueue<T> {
    tx: async_channel::Sender<T>,
    rx: async_channel::Receiver<T>,
    cancel: CancellationToken,
    capacity: usize,
    high_water: Arc<AtomicUsize>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            cancel: self.cancel.clone(),
            capacity: self.capacity,
            high_water: self.high_water.clone(),
        }
    }
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, cancel: CancellationToken) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = async_channel::bounded(capacity);
        Self {
            tx,
            rx,
            cancel,
            capacity,
            high_water: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enqueue an item, waiting for space.
    pub async fn put(&self, item: T) -> Result<(), QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(QueueError::Cancelled),
            sent = self.tx.send(item) => match sent {
                Ok(()) => {
                    self.high_water.fetch_max(self.tx.len(), Ordering::Relaxed);
                    Ok(())
                }
                Err(_) => Err(QueueError::Completed),
            },
        }
    }

    /// Dequeue an item, waiting for one. `Ok(None)` once the queue is
    /// complete and drained.
    pub async fn take(&self) -> Result<Option<T>, QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(QueueError::Cancelled),
            received = self.rx.recv() => Ok(received.ok()),
        }
    }

    /// Stop accepting items. Safe to call more than once.
    pub fn complete(&self) {
        self.tx.close();
    }

    pub fn is_complete(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest number of items observed queued at once.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}
