//! Transfer engine: runs one table through extraction, transformation and writing.
//!
//! Bulk tables use a fan-out/fan-in pipeline:
//!
//! ```text
//! extraction ─► raw queue ─► N transform workers ─► batch queue ─► W bulk writers
//! ```
//!
//! Upsert tables replace the workers and writers with a single ordered stage.
//! All stages share one cancellation token; the first primary failure cancels
//! the rest and is returned once every stage has unwound.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{MigrateError, Result};
use crate::mapping::{CompiledTable, CompiledWrite};
use crate::pipeline::{
    BatchPool, BoundedQueue, BulkWriter, SequencedUpsert, SessionMode, TransformWorker,
};
use crate::progress::ProgressTracker;
use crate::source::{BlobPolicy, RowSink, SourceReader};
use crate::target::TargetStore;
use crate::transform::{RowTransformer, RuleTransformer, TransformContext};

/// Transfer engine configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Transform workers.
    pub workers: usize,
    /// Bulk writers. Capped by the target store (1 inside a transaction).
    pub writers: usize,
    /// Target records per batch.
    pub batch_size: usize,
    pub raw_queue_capacity: usize,
    pub batch_queue_capacity: usize,
    /// Source rows per upsert window.
    pub upsert_batch_size: usize,
    pub blob: BlobPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let workers = 4;
        Self {
            workers,
            writers: 1,
            batch_size: 1000,
            raw_queue_capacity: workers * 256,
            batch_queue_capacity: 4,
            upsert_batch_size: 500,
            blob: BlobPolicy::default(),
        }
    }
}

/// Pipeline statistics for one table run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferStats {
    pub rows_read: u64,
    pub batches: u64,
    pub records_written: u64,
    pub workers: usize,
    pub writers: usize,
    pub raw_queue_high_water: usize,
    pub batch_queue_high_water: usize,
    pub buffers_allocated: u64,
    pub buffers_reused: u64,
}

enum StageOutput {
    Extracted(u64),
    Transformed(u64),
    Written(u64),
}

/// Runs tables from a source reader into a target store.
pub struct TransferEngine {
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetStore>,
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetStore>,
        config: TransferConfig,
    ) -> Self {
        Self {
            source,
            target,
            config,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Writer count after the target's limit is applied.
    pub fn effective_writers(&self) -> usize {
        let wanted = self.config.writers.max(1);
        match self.target.max_writers() {
            Some(limit) => wanted.min(limit.max(1)),
            None => wanted,
        }
    }

    /// Transfer one table. Counters go to `tracker`; the caller builds the result.
    pub async fn execute(
        &self,
        table: Arc<CompiledTable>,
        ctx: &TransformContext,
        tracker: Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<TransferStats> {
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }

        let start = Instant::now();
        let stage_cancel = cancel.child_token();
        let transformer: Arc<dyn RowTransformer> =
            Arc::new(RuleTransformer::new(table.clone(), ctx)?);
        let raw = BoundedQueue::new(self.config.raw_queue_capacity, stage_cancel.clone());
        let mut stages: JoinSet<Result<StageOutput>> = JoinSet::new();
        let mut stats = TransferStats::default();

        {
            let source = self.source.clone();
            let table = table.clone();
            let raw = raw.clone();
            let tracker = tracker.clone();
            let blob = self.config.blob;
            stages.spawn(async move {
                let mut sink = RowSink::new(raw.clone(), tracker);
                let read = source.stream_rows(&table, blob, &mut sink).await?;
                raw.complete();
                Ok(StageOutput::Extracted(read))
            });
        }

        let mut batch_queue = None;
        let mut batch_pool = None;
        match &table.write {
            CompiledWrite::Upsert { .. } => {
                info!(
                    "{}: ordered upsert (window {})",
                    table.name, self.config.upsert_batch_size
                );
                let upsert = SequencedUpsert::new(
                    self.target.clone(),
                    table.clone(),
                    transformer,
                    raw.clone(),
                    tracker.clone(),
                    self.config.upsert_batch_size,
                );
                stages.spawn(async move { upsert.run().await.map(StageOutput::Written) });
                stats.workers = 1;
                stats.writers = 1;
            }
            CompiledWrite::Bulk => {
                let workers = self.config.workers.max(1);
                let writers = self.effective_writers();
                let mode = SessionMode::for_writers(writers);
                info!(
                    "{}: bulk transfer (workers: {}, writers: {}, {:?})",
                    table.name, workers, writers, mode
                );

                let batches = BoundedQueue::new(self.config.batch_queue_capacity, stage_cancel.clone());
                let pool = Arc::new(BatchPool::new(
                    self.config.batch_queue_capacity + workers + writers,
                    self.config.batch_size,
                ));
                let running = Arc::new(AtomicUsize::new(workers));

                for id in 0..workers {
                    let worker = TransformWorker::new(
                        id,
                        transformer.clone(),
                        raw.clone(),
                        batches.clone(),
                        pool.clone(),
                        tracker.clone(),
                        self.config.batch_size,
                        running.clone(),
                    );
                    stages.spawn(async move { worker.run().await.map(|s| StageOutput::Transformed(s.batches)) });
                }

                let target_table = Arc::new(table.target.clone());
                for id in 0..writers {
                    let writer = BulkWriter::new(
                        id,
                        self.target.clone(),
                        target_table.clone(),
                        batches.clone(),
                        pool.clone(),
                        tracker.clone(),
                        mode,
                    );
                    stages.spawn(async move { writer.run().await.map(StageOutput::Written) });
                }

                stats.workers = workers;
                stats.writers = writers;
                batch_queue = Some(batches);
                batch_pool = Some(pool);
            }
        }

        let mut failure: Option<MigrateError> = None;
        while let Some(joined) = stages.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(MigrateError::transfer(
                    &table.name,
                    format!("pipeline task failed: {}", e),
                ))
            });
            match outcome {
                Ok(StageOutput::Extracted(n)) => stats.rows_read = n,
                Ok(StageOutput::Transformed(n)) => stats.batches += n,
                Ok(StageOutput::Written(n)) => stats.records_written += n,
                Err(e) => {
                    if !e.is_secondary() {
                        error!("{}: {}", table.name, e);
                    }
                    stage_cancel.cancel();
                    let replace = match &failure {
                        None => true,
                        Some(first) => first.is_secondary() && !e.is_secondary(),
                    };
                    if replace {
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        stats.raw_queue_high_water = raw.high_water();
        if let Some(batches) = &batch_queue {
            stats.batch_queue_high_water = batches.high_water();
        }
        if let Some(pool) = &batch_pool {
            stats.buffers_allocated = pool.allocated();
            stats.buffers_reused = pool.reused();
        }

        info!(
            "{}: read {} rows, wrote {} records in {:.2}s",
            table.name,
            stats.rows_read,
            stats.records_written,
            start.elapsed().as_secs_f64()
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlValue;
    use crate::mapping::TableSpec;
    use crate::progress::{TableResult, TableStatus};
    use crate::reference::{ReferenceCache, ReferenceKey, ReferenceLoadPolicy};
    use crate::security::FastHasher;
    use crate::source::MemorySource;
    use crate::target::MemoryTarget;
    use std::time::Duration;

    const ORDERS: &str = r#"
name: orders
select: SELECT OrderId, EventId FROM dbo.Orders
source_columns:
  - { name: OrderId, type: int }
  - { name: EventId, type: int }
columns:
  - { name: id, type: bigint, rule: { kind: direct, source: OrderId } }
  - { name: event_id, type: bigint, rule: { kind: foreign_key, source: EventId, reference: events } }
references:
  - { name: events, query: "SELECT id FROM event" }
"#;

    const MEMBERSHIPS: &str = r#"
name: memberships
select: SELECT UserId, Name FROM dbo.Users
source_columns:
  - { name: UserId, type: int }
  - { name: Name, type: text }
columns:
  - { name: id, type: bigint, rule: { kind: fan_out_id } }
  - { name: company_id, type: bigint, rule: { kind: fan_out_member } }
  - { name: name, type: text, rule: { kind: direct, source: Name } }
references:
  - { name: companies, query: "SELECT id FROM company" }
fan_out: { reference: companies, id_source: UserId }
write: { mode: upsert, key_columns: [id] }
"#;

    fn order(id: i32, event: Option<i32>) -> Vec<SqlValue> {
        vec![SqlValue::I32(id), SqlValue::from(event.map(i64::from))]
    }

    fn orders(n: i32) -> Vec<Vec<SqlValue>> {
        (1..=n).map(|i| order(i, Some(10))).collect()
    }

    fn config(workers: usize, writers: usize, batch_size: usize) -> TransferConfig {
        TransferConfig {
            workers,
            writers,
            batch_size,
            raw_queue_capacity: 8,
            batch_queue_capacity: 2,
            upsert_batch_size: 50,
            blob: BlobPolicy::default(),
        }
    }

    async fn run_table(
        yaml: &str,
        source: MemorySource,
        target: Arc<MemoryTarget>,
        config: TransferConfig,
        cancel: &CancellationToken,
    ) -> (Result<TransferStats>, TableResult) {
        let spec: TableSpec = serde_yaml::from_str(yaml).unwrap();
        let table = Arc::new(spec.compile("public").unwrap());
        let references =
            ReferenceCache::load_all(target.as_ref(), &table.references, ReferenceLoadPolicy::FailClosed)
                .await
                .unwrap();
        let ctx = TransformContext {
            references,
            hasher: Arc::new(FastHasher),
            cipher: None,
        };
        let tracker = Arc::new(ProgressTracker::new(&table.name, 1000, 10));
        let engine = TransferEngine::new(Arc::new(source), target, config);
        let result = engine.execute(table, &ctx, tracker.clone(), cancel).await;
        let summary = match &result {
            Ok(_) => tracker.finish(TableStatus::Completed, None),
            Err(e) => tracker.finish(TableStatus::Failed, Some(e.to_string())),
        };
        (result, summary)
    }

    fn events_target() -> Arc<MemoryTarget> {
        let target = MemoryTarget::new();
        target.set_keys("SELECT id FROM event", vec![ReferenceKey::Int(10)]);
        Arc::new(target)
    }

    #[tokio::test]
    async fn test_referential_filtering_three_rows() {
        let target = events_target();
        let source = MemorySource::new().with_rows(
            "SELECT OrderId, EventId FROM dbo.Orders",
            vec![order(1, Some(10)), order(2, Some(99)), order(3, None)],
        );
        let (result, summary) =
            run_table(ORDERS, source, target.clone(), config(2, 1, 10), &CancellationToken::new()).await;

        result.unwrap();
        assert_eq!(summary.records_processed, 3);
        assert_eq!(summary.records_inserted, 2);
        assert_eq!(summary.records_skipped, 1);
        assert_eq!(summary.skipped_by_reason.get("missing_reference:events"), Some(&1));
        assert!(summary.is_conserved());

        let mut ids: Vec<i64> = target
            .rows("orders")
            .iter()
            .filter_map(|r| r.get(0).and_then(SqlValue::as_i64))
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_backpressure_bounds_queues() {
        let target = Arc::new(MemoryTarget::new().with_write_delay(Duration::from_millis(1)));
        target.set_keys("SELECT id FROM event", vec![ReferenceKey::Int(10)]);
        let source = MemorySource::new().with_rows("SELECT OrderId, EventId FROM dbo.Orders", orders(300));
        let (result, summary) =
            run_table(ORDERS, source, target.clone(), config(2, 1, 10), &CancellationToken::new()).await;

        let stats = result.unwrap();
        assert!(stats.raw_queue_high_water <= 8);
        assert!(stats.batch_queue_high_water <= 2);
        assert_eq!(summary.records_inserted, 300);
        assert_eq!(target.rows("orders").len(), 300);
        assert!(stats.buffers_reused > 0);
    }

    #[tokio::test]
    async fn test_failed_write_is_all_or_nothing() {
        let target = events_target();
        target.fail_at("orders", 12);
        let source = MemorySource::new().with_rows("SELECT OrderId, EventId FROM dbo.Orders", orders(40));
        let (result, summary) =
            run_table(ORDERS, source, target.clone(), config(2, 1, 5), &CancellationToken::new()).await;

        assert!(matches!(result, Err(MigrateError::Transfer { .. })));
        assert!(target.rows("orders").is_empty());
        assert_eq!(summary.records_inserted, 0);
        assert!(summary.is_conserved());
    }

    #[tokio::test]
    async fn test_counters_are_conserved_with_mixed_outcomes() {
        let target = events_target();
        let source = MemorySource::new().with_rows(
            "SELECT OrderId, EventId FROM dbo.Orders",
            vec![
                order(1, Some(10)),
                order(2, Some(99)),
                vec![SqlValue::from("not a number"), SqlValue::I32(10)],
                order(4, Some(10)),
            ],
        );
        let (result, summary) =
            run_table(ORDERS, source, target, config(3, 2, 1), &CancellationToken::new()).await;

        result.unwrap();
        assert_eq!(summary.records_processed, 4);
        assert_eq!(summary.records_inserted, 2);
        assert_eq!(summary.records_skipped, 1);
        assert_eq!(summary.records_errored, 1);
        assert!(summary.is_conserved());
    }

    #[tokio::test]
    async fn test_parallel_writers_commit_per_batch() {
        let target = events_target();
        let source = MemorySource::new().with_rows("SELECT OrderId, EventId FROM dbo.Orders", orders(20));
        let (result, _) =
            run_table(ORDERS, source, target.clone(), config(2, 3, 5), &CancellationToken::new()).await;

        let stats = result.unwrap();
        assert_eq!(stats.writers, 3);
        assert_eq!(target.sessions_opened(), stats.batches);
        assert_eq!(target.rows("orders").len(), 20);
    }

    #[tokio::test]
    async fn test_fan_out_upsert_does_not_duplicate() {
        let target = MemoryTarget::new();
        target.set_keys(
            "SELECT id FROM company",
            vec![ReferenceKey::Int(2), ReferenceKey::Int(1)],
        );
        let target = Arc::new(target);
        let rows = || {
            MemorySource::new().with_rows(
                "SELECT UserId, Name FROM dbo.Users",
                vec![vec![SqlValue::I32(7), SqlValue::from("ann")]],
            )
        };

        for _ in 0..2 {
            let (result, summary) = run_table(
                MEMBERSHIPS,
                rows(),
                target.clone(),
                config(2, 2, 10),
                &CancellationToken::new(),
            )
            .await;
            result.unwrap();
            assert_eq!(summary.records_inserted, 1);
            assert_eq!(summary.records_written, 2);
        }

        let mut pairs: Vec<(i64, i64)> = target
            .rows("memberships")
            .iter()
            .map(|r| {
                (
                    r.get(0).and_then(SqlValue::as_i64).unwrap(),
                    r.get(1).and_then(SqlValue::as_i64).unwrap(),
                )
            })
            .collect();
        pairs.sort_unstable();
        assert_eq!(pairs, vec![(7001, 1), (7002, 2)]);
    }

    #[tokio::test]
    async fn test_source_failure_is_not_masked() {
        let target = events_target();
        let source = MemorySource::new()
            .with_rows("SELECT OrderId, EventId FROM dbo.Orders", orders(50))
            .fail_after("SELECT OrderId, EventId FROM dbo.Orders", 20);
        let (result, summary) =
            run_table(ORDERS, source, target.clone(), config(4, 1, 5), &CancellationToken::new()).await;

        let err = result.unwrap_err();
        assert!(!err.is_secondary());
        assert!(err.to_string().contains("source connection lost"));
        assert!(target.rows("orders").is_empty());
        assert!(summary.is_conserved());
    }

    #[tokio::test]
    async fn test_cancelled_run_returns_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let source = MemorySource::new().with_rows("SELECT OrderId, EventId FROM dbo.Orders", orders(5));
        let (result, summary) = run_table(ORDERS, source, events_target(), config(1, 1, 5), &cancel).await;

        assert!(matches!(result, Err(MigrateError::Cancelled)));
        assert_eq!(summary.status, TableStatus::Failed);
        assert_eq!(summary.records_processed, 0);
    }
}
