//! In-memory target store for tests and dry runs.
//!
//! Tables are keyed by unqualified target table name. Bulk sessions buffer
//! privately and become visible on `finish`; transactions work on a snapshot
//! that replaces the shared state on commit.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BulkSession, TargetStore, TargetTransaction};
use crate::core::{Batch, SqlType, SqlValue, TargetRecord};
use crate::error::{MigrateError, Result};
use crate::mapping::TargetTable;
use crate::reference::ReferenceKey;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: HashMap<String, Vec<TargetRecord>>,
    keys: HashMap<String, Vec<ReferenceKey>>,
    failing_queries: HashSet<String>,
    /// Fail when record number `n` (1-based) of a table is written.
    fail_at: HashMap<String, u64>,
    attempted: HashMap<String, u64>,
}

#[derive(Default)]
pub struct MemoryTarget {
    state: Arc<Mutex<MemoryState>>,
    write_delay: Option<Duration>,
    in_transaction: bool,
    sessions_opened: Arc<AtomicU64>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys returned by `load_keys(query)`.
    pub fn set_keys(&self, query: impl Into<String>, keys: Vec<ReferenceKey>) {
        self.state.lock().keys.insert(query.into(), keys);
    }

    /// Make `load_keys(query)` fail.
    pub fn fail_query(&self, query: impl Into<String>) {
        self.state.lock().failing_queries.insert(query.into());
    }

    /// Fail the write of record number `record` (1-based) into `table`.
    pub fn fail_at(&self, table: impl Into<String>, record: u64) {
        self.state.lock().fail_at.insert(table.into(), record);
    }

    /// Sleep on every batch write to model a slow consumer.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Seed a table with existing records.
    pub fn insert_rows(&self, table: impl Into<String>, records: Vec<TargetRecord>) {
        self.state
            .lock()
            .tables
            .entry(table.into())
            .or_default()
            .extend(records);
    }

    /// Committed records of a table.
    pub fn rows(&self, table: &str) -> Vec<TargetRecord> {
        self.state
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Bulk sessions opened so far, including those in transactions.
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    fn check_write(state: &mut MemoryState, table: &str) -> Result<()> {
        let attempted = {
            let n = state.attempted.entry(table.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        if state.fail_at.get(table) == Some(&attempted) {
            return Err(MigrateError::transfer(
                table,
                format!("write failed at record {}", attempted),
            ));
        }
        Ok(())
    }
}

fn key_of(record: &TargetRecord, indexes: &[usize]) -> Vec<SqlValue> {
    indexes
        .iter()
        .map(|&i| record.get(i).cloned().unwrap_or(SqlValue::Null(SqlType::Text)))
        .collect()
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn load_keys(&self, query: &str) -> Result<Vec<ReferenceKey>> {
        let state = self.state.lock();
        if state.failing_queries.contains(query) {
            return Err(MigrateError::transfer(
                "reference query",
                format!("query failed: {}", query),
            ));
        }
        Ok(state.keys.get(query).cloned().unwrap_or_default())
    }

    async fn open_bulk(&self, table: &TargetTable) -> Result<Box<dyn BulkSession>> {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            table: table.name.clone(),
            width: table.columns.len(),
            pending: Vec::new(),
            write_delay: self.write_delay,
        }))
    }

    async fn upsert(
        &self,
        table: &TargetTable,
        key_columns: &[String],
        records: &[TargetRecord],
    ) -> Result<u64> {
        let indexes = key_columns
            .iter()
            .map(|k| {
                table.column_index(k).ok_or_else(|| {
                    MigrateError::Config(format!("unknown key column '{}' on {}", k, table.name))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut state = self.state.lock();
        // Work on a copy so a failure part way leaves the table untouched.
        let mut rows = state.tables.get(&table.name).cloned().unwrap_or_default();
        for record in records {
            Self::check_write(&mut state, &table.name)?;
            let key = key_of(record, &indexes);
            match rows.iter_mut().find(|r| key_of(r, &indexes) == key) {
                Some(existing) => *existing = record.clone(),
                None => rows.push(record.clone()),
            }
        }
        state.tables.insert(table.name.clone(), rows);
        Ok(records.len() as u64)
    }

    async fn begin(&self) -> Result<Box<dyn TargetTransaction>> {
        if self.in_transaction {
            return Err(MigrateError::Config(
                "nested target transactions are not supported".into(),
            ));
        }
        let snapshot = self.state.lock().clone();
        let working = Arc::new(MemoryTarget {
            state: Arc::new(Mutex::new(snapshot)),
            write_delay: self.write_delay,
            in_transaction: true,
            sessions_opened: self.sessions_opened.clone(),
        });
        Ok(Box::new(MemoryTransaction {
            parent: self.state.clone(),
            working,
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn max_writers(&self) -> Option<usize> {
        self.in_transaction.then_some(1)
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    table: String,
    width: usize,
    pending: Vec<TargetRecord>,
    write_delay: Option<Duration>,
}

#[async_trait]
impl BulkSession for MemorySession {
    async fn write(&mut self, batch: &Batch) -> Result<()> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        for record in &batch.records {
            if record.len() != self.width {
                return Err(MigrateError::transfer(
                    &self.table,
                    format!("record has {} values, table has {} columns", record.len(), self.width),
                ));
            }
            MemoryTarget::check_write(&mut state, &self.table)?;
            self.pending.push(record.clone());
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64> {
        let MemorySession {
            state,
            table,
            pending,
            ..
        } = *self;
        let count = pending.len() as u64;
        state.lock().tables.entry(table).or_default().extend(pending);
        Ok(count)
    }

    async fn abort(self: Box<Self>) {}
}

struct MemoryTransaction {
    parent: Arc<Mutex<MemoryState>>,
    working: Arc<MemoryTarget>,
}

#[async_trait]
impl TargetTransaction for MemoryTransaction {
    fn store(&self) -> Arc<dyn TargetStore> {
        self.working.clone()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let tables = self.working.state.lock().tables.clone();
        self.parent.lock().tables = tables;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
