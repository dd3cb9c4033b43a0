//! Transform workers: raw rows in, batches out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use super::{BatchPool, BoundedQueue};
use crate::core::{Batch, SourceRow};
use crate::error::{MigrateError, Result};
use crate::progress::ProgressTracker;
use crate::transform::{RowTransformer, TransformOutcome};

/// Lifecycle of a transform worker.
///
/// `Idle -> Draining -> Accumulating -> Flushing -> Idle`, ending in `Drained`
/// once the raw queue is complete and the last partial batch is handed off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No rows buffered.
    Idle,
    /// Waiting on the raw queue.
    Draining,
    /// Building a batch.
    Accumulating,
    /// Handing a batch to the writers.
    Flushing,
    Drained,
}

impl WorkerState {
    pub fn can_move_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Idle, Draining)
                | (Draining, Accumulating)
                | (Draining, Flushing)
                | (Draining, Drained)
                | (Accumulating, Draining)
                | (Accumulating, Flushing)
                | (Flushing, Idle)
                | (Flushing, Drained)
        ) || (next == Drained)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub rows: u64,
    pub batches: u64,
}

pub struct TransformWorker {
    id: usize,
    transformer: Arc<dyn RowTransformer>,
    raw: BoundedQueue<SourceRow>,
    batches: BoundedQueue<Batch>,
    pool: Arc<BatchPool>,
    tracker: Arc<ProgressTracker>,
    batch_size: usize,
    /// Workers still running; the last one out completes the batch queue.
    running: Arc<AtomicUsize>,
    state: WorkerState,
}

impl TransformWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        transformer: Arc<dyn RowTransformer>,
        raw: BoundedQueue<SourceRow>,
        batches: BoundedQueue<Batch>,
        pool: Arc<BatchPool>,
        tracker: Arc<ProgressTracker>,
        batch_size: usize,
        running: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            id,
            transformer,
            raw,
            batches,
            pool,
            tracker,
            batch_size: batch_size.max(1),
            running,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn move_to(&mut self, next: WorkerState) {
        if self.state != next {
            debug_assert!(self.state.can_move_to(next), "{:?} -> {:?}", self.state, next);
            trace!("worker {}: {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        }
    }

    /// Run until the raw queue is drained or the run is cancelled.
    ///
    /// Records produced from one source row always land in the same batch, so
    /// a batch can exceed `batch_size` by one fan-out group.
    pub async fn run(mut self) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        let mut batch = self.pool.acquire();

        loop {
            self.move_to(WorkerState::Draining);
            let row = match self.raw.take().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => {
                    // Partial batch is discarded.
                    self.pool.release(batch);
                    self.move_to(WorkerState::Drained);
                    return Err(e.into());
                }
            };
            stats.rows += 1;

            match self.transformer.transform(&row) {
                Ok(TransformOutcome::Emit(records)) => {
                    batch.push_row(records);
                    self.tracker.row_accepted();
                }
                Ok(TransformOutcome::Skip(reason)) => self.tracker.row_skipped(&reason),
                Err(e) => self.tracker.row_errored(row.sequence(), &e),
            }

            if batch.source_rows > 0 {
                self.move_to(WorkerState::Accumulating);
            }
            if batch.len() >= self.batch_size {
                self.move_to(WorkerState::Flushing);
                let full = std::mem::replace(&mut batch, self.pool.acquire());
                if let Err(e) = self.batches.put(full).await {
                    self.pool.release(batch);
                    self.move_to(WorkerState::Drained);
                    return Err(e.into());
                }
                stats.batches += 1;
                self.move_to(WorkerState::Idle);
            }
        }

        if batch.is_empty() {
            self.pool.release(batch);
        } else {
            self.move_to(WorkerState::Flushing);
            self.batches.put(batch).await.map_err(MigrateError::from)?;
            stats.batches += 1;
        }
        self.move_to(WorkerState::Drained);

        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.batches.complete();
        }
        debug!(
            "worker {}: drained ({} rows, {} batches)",
            self.id, stats.rows, stats.batches
        );
        Ok(stats)
    }
}
