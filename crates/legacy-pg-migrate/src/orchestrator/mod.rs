//! Migration coordinator: runs "migrate table X" and whole-run sequences.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::mapping::MigrationLogics;
use crate::progress::{ProgressObserver, ProgressTracker, TableResult, TableStatus};
use crate::reference::ReferenceCache;
use crate::security::{hasher_for, AesGcmCipher, FieldCipher, PasswordHasher};
use crate::source::{MssqlSource, SourceReader};
use crate::target::{PostgresTarget, TargetStore};
use crate::transfer::{TransferEngine, TransferStats};
use crate::transform::TransformContext;

/// Owns the source and target handles for a run.
pub struct Coordinator {
    config: Config,
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetStore>,
    observer: Option<ProgressObserver>,
}

/// Result of a `run_all`.
#[derive(Debug, Serialize)]
pub struct RunResult {
    /// Unique run identifier.
    pub run_id: String,

    /// `completed`, `failed`, `rolled_back` or `cancelled`.
    pub status: String,

    pub transactional: bool,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    pub duration_seconds: f64,

    pub tables_total: usize,

    pub tables_completed: usize,

    pub tables_failed: usize,

    /// Source rows that reached the target in tables that stayed committed.
    pub total_inserted: u64,

    pub total_written: u64,

    pub rows_per_second: i64,

    /// SHA256 of the configuration the run used.
    pub config_hash: String,

    pub tables: Vec<TableResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip)]
    failure: Option<MigrateError>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// The error that stopped the run, if any.
    pub fn take_failure(&mut self) -> Option<MigrateError> {
        self.failure.take()
    }

    /// Serialize the result to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Connectivity of both stores.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
}

impl Coordinator {
    pub fn new(
        config: Config,
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetStore>,
    ) -> Self {
        Self {
            config,
            source,
            target,
            observer: None,
        }
    }

    /// Open the MSSQL and PostgreSQL pools described by `config`.
    pub async fn connect(config: Config) -> Result<Self> {
        let mssql_pool_size = config.migration.get_max_mssql_connections() as u32;
        let source = MssqlSource::connect(&config.source, mssql_pool_size).await?;

        let max_conns = config.migration.get_max_pg_connections();
        let target = PostgresTarget::connect(&config.target, max_conns).await?;

        Ok(Self::new(config, Arc::new(source), Arc::new(target)))
    }

    /// Receive progress events from every table run.
    pub fn with_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mapping metadata for one table.
    pub fn mapping(&self, table: &str) -> Result<MigrationLogics> {
        self.config
            .table(table)
            .map(MigrationLogics::for_table)
            .ok_or_else(|| MigrateError::UnknownTable(table.to_string()))
    }

    /// Mapping metadata for every table, in declaration order.
    pub fn mappings(&self) -> Vec<MigrationLogics> {
        self.config
            .tables
            .iter()
            .map(MigrationLogics::for_table)
            .collect()
    }

    /// Migrate one table.
    ///
    /// With `transactional`, the table runs inside one target transaction
    /// that is rolled back before a failure is returned.
    pub async fn run_migration(
        &self,
        table: &str,
        transactional: bool,
        cancel: &CancellationToken,
    ) -> Result<TableResult> {
        if self.config.table(table).is_none() {
            return Err(MigrateError::UnknownTable(table.to_string()));
        }

        if !transactional {
            let (result, failure) = self.migrate_table(&self.target, table, cancel).await;
            return match failure {
                Some(e) => Err(e),
                None => Ok(result),
            };
        }

        let tx = self.target.begin().await?;
        let store = tx.store();
        let (result, failure) = self.migrate_table(&store, table, cancel).await;
        drop(store);

        match failure {
            None => {
                tx.commit().await?;
                Ok(result)
            }
            Some(e) => {
                warn!("{}: rolling back", table);
                if let Err(rollback) = tx.rollback().await {
                    error!("{}: rollback failed: {}", table, rollback);
                }
                Err(e)
            }
        }
    }

    /// Migrate every configured table in dependency order.
    ///
    /// Stops at the first failed table; the rest are reported as `not_run`.
    /// With `transactional`, all tables share one target transaction and a
    /// failure rolls back the ones that had already completed.
    pub async fn run_all(
        &self,
        transactional: bool,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        let order = self.config.execution_order()?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let start = Instant::now();
        info!(
            "Starting run {} ({} tables{})",
            run_id,
            order.len(),
            if transactional { ", transactional" } else { "" }
        );

        let tx = if transactional {
            Some(self.target.begin().await?)
        } else {
            None
        };
        let store = match &tx {
            Some(tx) => tx.store(),
            None => self.target.clone(),
        };

        let mut tables = Vec::with_capacity(order.len());
        let mut failure: Option<MigrateError> = None;
        for name in &order {
            if failure.is_none() && cancel.is_cancelled() {
                failure = Some(MigrateError::Cancelled);
            }
            if failure.is_some() {
                tables.push(TableResult::not_run(name.as_str()));
                continue;
            }
            let (result, err) = self.migrate_table(&store, name, cancel).await;
            tables.push(result);
            failure = err;
        }
        drop(store);

        let mut rolled_back = false;
        if let Some(tx) = tx {
            if failure.is_none() {
                if let Err(e) = tx.commit().await {
                    error!("Commit failed: {}", e);
                    failure = Some(e);
                    rolled_back = true;
                }
            } else {
                warn!("Rolling back run {}", run_id);
                if let Err(e) = tx.rollback().await {
                    error!("Rollback failed: {}", e);
                }
                rolled_back = true;
            }
        }
        if rolled_back {
            tables.iter_mut().for_each(TableResult::roll_back);
        }

        let completed_at = Utc::now();
        let duration = start.elapsed().as_secs_f64();
        let committed = || tables.iter().filter(|t| t.status == TableStatus::Completed);
        let total_inserted: u64 = committed().map(|t| t.records_inserted).sum();
        let total_written: u64 = committed().map(|t| t.records_written).sum();
        let tables_completed = committed().count();
        let tables_failed = tables
            .iter()
            .filter(|t| t.status == TableStatus::Failed)
            .count();

        let status = match &failure {
            None => "completed",
            Some(MigrateError::Cancelled) => "cancelled",
            Some(_) if rolled_back => "rolled_back",
            Some(_) => "failed",
        };
        info!(
            "Run {} {}: {}/{} tables, {} rows inserted in {:.2}s",
            run_id,
            status,
            tables_completed,
            tables.len(),
            total_inserted,
            duration
        );

        Ok(RunResult {
            run_id,
            status: status.to_string(),
            transactional,
            started_at,
            completed_at,
            duration_seconds: duration,
            tables_total: tables.len(),
            tables_completed,
            tables_failed,
            total_inserted,
            total_written,
            rows_per_second: if duration > 0.0 {
                (total_inserted as f64 / duration) as i64
            } else {
                0
            },
            config_hash: self.config.hash(),
            tables,
            error: failure.as_ref().map(|e| e.to_string()),
            failure,
        })
    }

    /// Ping both stores and time the round trips.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let start = Instant::now();
        let source = self.source.ping().await;
        let source_latency_ms = start.elapsed().as_millis() as u64;

        let start = Instant::now();
        let target = self.target.ping().await;
        let target_latency_ms = start.elapsed().as_millis() as u64;

        Ok(HealthCheckResult {
            healthy: source.is_ok() && target.is_ok(),
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.err().map(|e| e.to_string()),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.err().map(|e| e.to_string()),
        })
    }

    /// Run one table against `store` and build its result.
    async fn migrate_table(
        &self,
        store: &Arc<dyn TargetStore>,
        name: &str,
        cancel: &CancellationToken,
    ) -> (TableResult, Option<MigrateError>) {
        let migration = &self.config.migration;
        let tracker = Arc::new(
            ProgressTracker::new(
                name,
                migration.get_progress_interval(),
                migration.get_error_log_limit(),
            )
            .with_observer(self.observer.clone()),
        );

        match self.transfer_table(store, name, tracker.clone(), cancel).await {
            Ok(stats) => {
                let result = tracker.finish(TableStatus::Completed, None);
                info!(
                    "{}: {} processed, {} inserted, {} skipped, {} errored ({} batches, raw queue peak {})",
                    name,
                    result.records_processed,
                    result.records_inserted,
                    result.records_skipped,
                    result.records_errored,
                    stats.batches,
                    stats.raw_queue_high_water
                );
                (result, None)
            }
            Err(e) => {
                error!("{}: {}", name, e);
                let result = tracker.finish(TableStatus::Failed, Some(e.to_string()));
                (result, Some(e))
            }
        }
    }

    async fn transfer_table(
        &self,
        store: &Arc<dyn TargetStore>,
        name: &str,
        tracker: Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<TransferStats> {
        let table = Arc::new(self.config.compile_table(name)?);
        let references = ReferenceCache::load_all(
            store.as_ref(),
            &table.references,
            self.config.migration.reference_load_policy,
        )
        .await?;

        let (hasher, cipher) = self.security()?;
        let ctx = TransformContext {
            references,
            hasher,
            cipher,
        };

        let engine = TransferEngine::new(
            self.source.clone(),
            store.clone(),
            self.config.migration.transfer_config(),
        );
        engine.execute(table, &ctx, tracker, cancel).await
    }

    fn security(&self) -> Result<(Arc<dyn PasswordHasher>, Option<Arc<dyn FieldCipher>>)> {
        let security = &self.config.security;
        let hasher: Arc<dyn PasswordHasher> =
            Arc::from(hasher_for(security.fast_mode, security.hash_iterations));
        let cipher = match &security.encryption_key {
            Some(key) => Some(Arc::new(AesGcmCipher::from_base64(key)?) as Arc<dyn FieldCipher>),
            None => None,
        };
        Ok((hasher, cipher))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlValue;
    use crate::progress::ProgressEvent;
    use crate::reference::ReferenceKey;
    use crate::source::MemorySource;
    use crate::target::MemoryTarget;
    use parking_lot::Mutex;

    const CONFIG: &str = r#"
source: { host: legacy-db, database: legacy, user: sa, password: secret }
target: { host: localhost, database: app, user: app, password: secret }
migration: { workers: 2, batch_size: 2, writers: 1 }
security: { fast_mode: true }
tables:
  - name: orders
    select: SELECT OrderId, EventId FROM dbo.Orders
    source_columns:
      - { name: OrderId, type: int }
      - { name: EventId, type: int }
    columns:
      - { name: id, type: bigint, rule: { kind: direct, source: OrderId } }
      - { name: event_id, type: bigint, rule: { kind: foreign_key, source: EventId, reference: events } }
    references:
      - { name: events, query: "SELECT id FROM event" }
    depends_on: [event]
  - name: event
    select: SELECT EventId, Title FROM dbo.Events
    source_columns:
      - { name: EventId, type: int }
      - { name: Title, type: nvarchar }
    columns:
      - { name: id, type: bigint, rule: { kind: direct, source: EventId } }
      - { name: title, type: text, description: "Event title", rule: { kind: direct, source: Title } }
"#;

    fn source() -> MemorySource {
        MemorySource::new()
            .with_rows(
                "SELECT EventId, Title FROM dbo.Events",
                vec![
                    vec![SqlValue::I32(10), SqlValue::from("Launch")],
                    vec![SqlValue::I32(11), SqlValue::from("Review")],
                ],
            )
            .with_rows(
                "SELECT OrderId, EventId FROM dbo.Orders",
                vec![
                    vec![SqlValue::I32(1), SqlValue::I32(10)],
                    vec![SqlValue::I32(2), SqlValue::I32(99)],
                    vec![SqlValue::I32(3), SqlValue::I32(11)],
                ],
            )
    }

    fn target() -> Arc<MemoryTarget> {
        let target = MemoryTarget::new();
        target.set_keys(
            "SELECT id FROM event",
            vec![ReferenceKey::Int(10), ReferenceKey::Int(11)],
        );
        Arc::new(target)
    }

    fn coordinator(target: Arc<MemoryTarget>) -> Coordinator {
        let config = Config::from_yaml(CONFIG).unwrap();
        Coordinator::new(config, Arc::new(source()), target)
    }

    fn statuses(result: &RunResult) -> Vec<(&str, TableStatus)> {
        result
            .tables
            .iter()
            .map(|t| (t.table.as_str(), t.status))
            .collect()
    }

    #[tokio::test]
    async fn test_run_all_follows_dependencies() {
        let target = target();
        let result = coordinator(target.clone())
            .run_all(false, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.status, "completed");
        assert_eq!(
            statuses(&result),
            vec![("event", TableStatus::Completed), ("orders", TableStatus::Completed)]
        );
        assert_eq!(result.total_inserted, 4);
        assert_eq!(result.tables[1].skipped_by_reason.get("missing_reference:events"), Some(&1));
        assert_eq!(target.rows("event").len(), 2);
        assert_eq!(target.rows("orders").len(), 2);
    }

    #[tokio::test]
    async fn test_run_all_stops_at_first_failure() {
        let target = target();
        target.fail_at("event", 1);
        let mut result = coordinator(target.clone())
            .run_all(false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, "failed");
        assert_eq!(
            statuses(&result),
            vec![("event", TableStatus::Failed), ("orders", TableStatus::NotRun)]
        );
        assert!(matches!(result.take_failure(), Some(MigrateError::Transfer { .. })));
        assert!(result.tables.iter().all(TableResult::is_conserved));
    }

    #[tokio::test]
    async fn test_transactional_failure_rolls_back_everything() {
        let target = target();
        target.fail_at("orders", 2);
        let result = coordinator(target.clone())
            .run_all(true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, "rolled_back");
        assert_eq!(
            statuses(&result),
            vec![("event", TableStatus::RolledBack), ("orders", TableStatus::Failed)]
        );
        assert_eq!(result.total_inserted, 0);
        assert!(target.rows("event").is_empty());
        assert!(target.rows("orders").is_empty());
    }

    const SCORES: &str = r#"
source: { host: legacy-db, database: legacy, user: sa, password: secret }
target: { host: localhost, database: app, user: app, password: secret }
migration: { upsert_batch_size: 1 }
security: { fast_mode: true }
tables:
  - name: scores
    select: SELECT MemberId, Score FROM dbo.Scores
    source_columns:
      - { name: MemberId, type: int }
      - { name: Score, type: int }
    columns:
      - { name: member_id, type: bigint, rule: { kind: direct, source: MemberId } }
      - { name: score, type: bigint, rule: { kind: direct, source: Score } }
    write: { mode: upsert, key_columns: [member_id] }
"#;

    #[tokio::test]
    async fn test_transactional_rollback_clears_upserted_counts() {
        let source = MemorySource::new().with_rows(
            "SELECT MemberId, Score FROM dbo.Scores",
            (1..=4).map(|i| vec![SqlValue::I32(i), SqlValue::I32(i * 10)]).collect(),
        );
        let target = Arc::new(MemoryTarget::new());
        target.fail_at("scores", 3);
        let config = Config::from_yaml(SCORES).unwrap();
        let result = Coordinator::new(config, Arc::new(source), target.clone())
            .run_all(true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, "rolled_back");
        let scores = &result.tables[0];
        assert_eq!(scores.status, TableStatus::Failed);
        assert_eq!(scores.records_inserted, 0);
        assert_eq!(scores.records_written, 0);
        assert!(scores.records_errored >= 2);
        assert!(scores.is_conserved());
        assert!(scores.errors.iter().any(|e| e.contains("rolled_back")));
        assert_eq!(result.total_inserted, 0);
        assert!(target.rows("scores").is_empty());
    }

    #[tokio::test]
    async fn test_transactional_run_survives_failed_reference_load() {
        let target = target();
        target.fail_query("SELECT id FROM event");
        let result = coordinator(target.clone())
            .run_all(true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, "completed");
        let orders = &result.tables[1];
        assert_eq!(orders.records_skipped, 3);
        assert_eq!(
            orders.skipped_by_reason.get("reference_unavailable:events"),
            Some(&3)
        );
        assert_eq!(target.rows("event").len(), 2);
        assert!(target.rows("orders").is_empty());
    }

    #[tokio::test]
    async fn test_transactional_success_commits() {
        let target = target();
        let result = coordinator(target.clone())
            .run_all(true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, "completed");
        assert_eq!(target.rows("event").len(), 2);
        assert_eq!(target.rows("orders").len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_not_run() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = coordinator(target()).run_all(false, &cancel).await.unwrap();

        assert_eq!(result.status, "cancelled");
        assert!(result
            .tables
            .iter()
            .all(|t| t.status == TableStatus::NotRun));
    }

    #[tokio::test]
    async fn test_run_migration_single_table() {
        let target = target();
        let result = coordinator(target.clone())
            .run_migration("orders", false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.records_processed, 3);
        assert_eq!(result.records_inserted, 2);
        assert_eq!(result.records_skipped, 1);
        assert!(target.rows("event").is_empty());
    }

    #[tokio::test]
    async fn test_run_migration_transactional_failure_leaves_nothing() {
        let target = target();
        target.fail_at("orders", 2);
        let err = coordinator(target.clone())
            .run_migration("orders", true, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, MigrateError::Transfer { .. }));
        assert!(target.rows("orders").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let err = coordinator(target())
            .run_migration("nope", false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::UnknownTable(_)));
    }

    #[tokio::test]
    async fn test_observer_sees_final_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let coordinator = coordinator(target()).with_observer(Arc::new(move |event: &ProgressEvent| {
            if event.done {
                sink.lock().push(event.table.clone());
            }
        }));
        coordinator
            .run_all(false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec!["event".to_string(), "orders".to_string()]);
    }

    #[tokio::test]
    async fn test_health_check_with_memory_stores() {
        let health = coordinator(target()).health_check().await.unwrap();
        assert!(health.healthy);
        assert!(health.source_error.is_none());
    }

    #[test]
    fn test_mapping_triples() {
        let coordinator = coordinator(target());
        let logics = coordinator.mapping("event").unwrap();
        assert_eq!(logics.columns.len(), 2);
        assert_eq!(logics.columns[1].source, "Title");
        assert_eq!(logics.columns[1].description, "Event title");
        assert_eq!(logics.columns[1].target, "title");
        assert!(coordinator.mapping("missing").is_err());
    }

    #[tokio::test]
    async fn test_run_summary_json() {
        let result = coordinator(target())
            .run_all(false, &CancellationToken::new())
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["tables"].as_array().map(Vec::len), Some(2));
        assert!(json.get("failure").is_none());
        assert!(json["run_id"].as_str().is_some());
    }
}
