//! Bulk writers: drain the batch queue into target bulk sessions.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{BatchPool, BoundedQueue};
use crate::core::Batch;
use crate::error::Result;
use crate::mapping::TargetTable;
use crate::progress::ProgressTracker;
use crate::target::{BulkSession, TargetStore};

/// How a writer maps batches onto bulk sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// One session for the writer's whole lifetime.
    PerWriter,
    /// A fresh session per batch, each on its own pooled connection.
    PerBatch,
}

impl SessionMode {
    /// Single-writer runs keep one session; parallel writers commit per batch.
    pub fn for_writers(writers: usize) -> Self {
        if writers <= 1 {
            SessionMode::PerWriter
        } else {
            SessionMode::PerBatch
        }
    }
}

pub struct BulkWriter {
    id: usize,
    store: Arc<dyn TargetStore>,
    table: Arc<TargetTable>,
    batches: BoundedQueue<Batch>,
    pool: Arc<BatchPool>,
    tracker: Arc<ProgressTracker>,
    mode: SessionMode,
}

impl BulkWriter {
    pub fn new(
        id: usize,
        store: Arc<dyn TargetStore>,
        table: Arc<TargetTable>,
        batches: BoundedQueue<Batch>,
        pool: Arc<BatchPool>,
        tracker: Arc<ProgressTracker>,
        mode: SessionMode,
    ) -> Self {
        Self {
            id,
            store,
            table,
            batches,
            pool,
            tracker,
            mode,
        }
    }

    /// Write until the batch queue is drained. Returns records committed.
    ///
    /// Any failure aborts the open session, so nothing from it becomes visible.
    pub async fn run(self) -> Result<u64> {
        let written = match self.mode {
            SessionMode::PerWriter => self.run_single_session().await?,
            SessionMode::PerBatch => self.run_session_per_batch().await?,
        };
        debug!("writer {}: done ({} records)", self.id, written);
        Ok(written)
    }

    async fn run_single_session(&self) -> Result<u64> {
        let mut session: Option<Box<dyn BulkSession>> = None;
        let mut source_rows = 0u64;

        loop {
            let batch = match self.batches.take().await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    abort(session, &self.table.name).await;
                    return Err(e.into());
                }
            };

            if session.is_none() {
                session = Some(self.store.open_bulk(&self.table).await?);
            }
            let result = match session.as_mut() {
                Some(s) => s.write(&batch).await,
                None => Ok(()),
            };
            source_rows += batch.source_rows;
            self.pool.release(batch);

            if let Err(e) = result {
                abort(session, &self.table.name).await;
                return Err(e);
            }
        }

        match session {
            Some(s) => {
                let records = s.finish().await?;
                self.tracker.rows_inserted(source_rows, records);
                Ok(records)
            }
            None => Ok(0),
        }
    }

    async fn run_session_per_batch(&self) -> Result<u64> {
        let mut total = 0u64;
        while let Some(batch) = self.batches.take().await? {
            let mut session = self.store.open_bulk(&self.table).await?;
            let result = session.write(&batch).await;
            let source_rows = batch.source_rows;
            self.pool.release(batch);

            if let Err(e) = result {
                session.abort().await;
                return Err(e);
            }
            let records = session.finish().await?;
            self.tracker.rows_inserted(source_rows, records);
            total += records;
        }
        Ok(total)
    }
}

async fn abort(session: Option<Box<dyn BulkSession>>, table: &str) {
    if let Some(s) = session {
        warn!("{}: aborting bulk session", table);
        s.abort().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SqlType, SqlValue, TargetRecord};
    use crate::error::MigrateError;
    use crate::mapping::TargetColumn;
    use crate::target::MemoryTarget;
    use tokio_util::sync::CancellationToken;

    fn table() -> Arc<TargetTable> {
        Arc::new(TargetTable {
            schema: "public".into(),
            name: "event".into(),
            columns: vec![TargetColumn {
                name: "id".into(),
                ty: SqlType::I64,
            }],
        })
    }

    fn batch(ids: std::ops::RangeInclusive<i64>) -> Batch {
        let mut b = Batch::with_capacity(8);
        for id in ids {
            b.push_row(vec![TargetRecord::new(vec![SqlValue::I64(id)])]);
        }
        b
    }

    async fn run_writer(target: Arc<MemoryTarget>, mode: SessionMode, batches: Vec<Batch>) -> (Result<u64>, Arc<ProgressTracker>) {
        let queue = BoundedQueue::new(8, CancellationToken::new());
        for b in batches {
            queue.put(b).await.unwrap();
        }
        queue.complete();
        let tracker = Arc::new(ProgressTracker::new("event", 1000, 10));
        let writer = BulkWriter::new(
            0,
            target,
            table(),
            queue,
            Arc::new(BatchPool::new(2, 8)),
            tracker.clone(),
            mode,
        );
        (writer.run().await, tracker)
    }

    #[tokio::test]
    async fn test_per_writer_uses_one_session() {
        let target = Arc::new(MemoryTarget::new());
        let (result, tracker) =
            run_writer(target.clone(), SessionMode::PerWriter, vec![batch(1..=3), batch(4..=5)]).await;
        assert_eq!(result.unwrap(), 5);
        assert_eq!(target.sessions_opened(), 1);
        assert_eq!(target.rows("event").len(), 5);
        assert_eq!(tracker.counters().snapshot().inserted, 5);
    }

    #[tokio::test]
    async fn test_per_batch_commits_each_batch() {
        let target = Arc::new(MemoryTarget::new());
        let (result, _) =
            run_writer(target.clone(), SessionMode::PerBatch, vec![batch(1..=3), batch(4..=5)]).await;
        assert_eq!(result.unwrap(), 5);
        assert_eq!(target.sessions_opened(), 2);
    }

    #[tokio::test]
    async fn test_failure_aborts_whole_session() {
        let target = Arc::new(MemoryTarget::new());
        target.fail_at("event", 4);
        let (result, tracker) =
            run_writer(target.clone(), SessionMode::PerWriter, vec![batch(1..=3), batch(4..=5)]).await;
        assert!(matches!(result, Err(MigrateError::Transfer { .. })));
        assert!(target.rows("event").is_empty());
        assert_eq!(tracker.counters().snapshot().inserted, 0);
    }

    #[tokio::test]
    async fn test_per_batch_failure_keeps_earlier_batches() {
        let target = Arc::new(MemoryTarget::new());
        target.fail_at("event", 5);
        let (result, tracker) =
            run_writer(target.clone(), SessionMode::PerBatch, vec![batch(1..=3), batch(4..=5)]).await;
        assert!(result.is_err());
        assert_eq!(target.rows("event").len(), 3);
        assert_eq!(tracker.counters().snapshot().inserted, 3);
    }

    #[test]
    fn test_mode_for_writer_count() {
        assert_eq!(SessionMode::for_writers(1), SessionMode::PerWriter);
        assert_eq!(SessionMode::for_writers(4), SessionMode::PerBatch);
    }
}
