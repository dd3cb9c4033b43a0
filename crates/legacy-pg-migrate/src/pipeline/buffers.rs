//! Recycling pool for batch buffers.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::Batch;

/// Hands out empty batches and takes them back after a writer is done.
///
/// Holds at most `retain` idle buffers; extra returns are dropped.
pub struct BatchPool {
    idle_tx: async_channel::Sender<Batch>,
    idle_rx: async_channel::Receiver<Batch>,
    batch_capacity: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl BatchPool {
    pub fn new(retain: usize, batch_capacity: usize) -> Self {
        let (idle_tx, idle_rx) = async_channel::bounded(retain.max(1));
        Self {
            idle_tx,
            idle_rx,
            batch_capacity,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// An empty batch, recycled when one is available.
    pub fn acquire(&self) -> Batch {
        match self.idle_rx.try_recv() {
            Ok(batch) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                batch
            }
            Err(_) => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Batch::with_capacity(self.batch_capacity)
            }
        }
    }

    /// Return a batch for reuse. Its contents are cleared here.
    pub fn release(&self, mut batch: Batch) {
        batch.clear();
        // Full pool: let this one go.
        let _ = self.idle_tx.try_send(batch);
    }

    /// Buffers allocated fresh.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Buffers handed out again after a release.
    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SqlValue, TargetRecord};

    #[test]
    fn test_released_batches_are_reused_empty() {
        let pool = BatchPool::new(2, 8);
        let mut batch = pool.acquire();
        batch.push_row(vec![TargetRecord::new(vec![SqlValue::I32(1)])]);
        pool.release(batch);

        let again = pool.acquire();
        assert!(again.is_empty());
        assert_eq!(again.source_rows, 0);
        assert!(again.records.capacity() >= 8);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.reused(), 1);
    }

    #[test]
    fn test_pool_retains_a_bounded_number() {
        let pool = BatchPool::new(1, 4);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        let _ = pool.acquire();
        let _ = pool.acquire();
        assert_eq!(pool.allocated(), 3);
        assert_eq!(pool.reused(), 1);
    }
}
