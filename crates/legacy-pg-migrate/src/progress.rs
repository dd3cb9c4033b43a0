//! Progress counters, periodic progress events and per-table results.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::RowError;
use crate::transform::SkipReason;

/// Longest diagnostic message kept per row.
const MAX_DIAGNOSTIC_LEN: usize = 240;

/// Reason recorded for rows in flight when a run failed.
pub const ABORTED_REASON: &str = "aborted";

/// Reason recorded for inserted rows undone by a transaction rollback.
pub const ROLLED_BACK_REASON: &str = "rolled_back";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Source rows pulled from the driver, before transformation.
    Read,
    /// Source rows that reached a verdict (including rejected ones).
    Processed,
    /// Source rows whose records reached the target.
    Inserted,
    Skipped,
    Errored,
    /// Target records written (exceeds inserted with fan-out).
    Written,
}

/// Lock-free counters shared by every stage.
#[derive(Debug, Default)]
pub struct MigrationCounters {
    read: AtomicU64,
    processed: AtomicU64,
    inserted: AtomicU64,
    skipped: AtomicU64,
    errored: AtomicU64,
    written: AtomicU64,
}

impl MigrationCounters {
    fn slot(&self, kind: Counter) -> &AtomicU64 {
        match kind {
            Counter::Read => &self.read,
            Counter::Processed => &self.processed,
            Counter::Inserted => &self.inserted,
            Counter::Skipped => &self.skipped,
            Counter::Errored => &self.errored,
            Counter::Written => &self.written,
        }
    }

    /// Add one; returns the new value.
    pub fn increment(&self, kind: Counter) -> u64 {
        self.add(kind, 1)
    }

    /// Add `n`; returns the new value.
    pub fn add(&self, kind: Counter, n: u64) -> u64 {
        self.slot(kind).fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn get(&self, kind: Counter) -> u64 {
        self.slot(kind).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            read: self.get(Counter::Read),
            processed: self.get(Counter::Processed),
            inserted: self.get(Counter::Inserted),
            skipped: self.get(Counter::Skipped),
            errored: self.get(Counter::Errored),
            written: self.get(Counter::Written),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CounterSnapshot {
    pub read: u64,
    pub processed: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub errored: u64,
    pub written: u64,
}

impl CounterSnapshot {
    /// Rows read but not yet inserted, skipped or errored.
    pub fn unaccounted(&self) -> u64 {
        self.processed
            .saturating_sub(self.inserted + self.skipped + self.errored)
    }
}

/// Periodic progress report.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub table: String,
    pub processed: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub errored: u64,
    pub elapsed_seconds: f64,
    pub rows_per_second: i64,
    /// True for the terminal summary event.
    pub done: bool,
}

/// Callback receiving every progress event.
pub type ProgressObserver = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Outcome of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Completed,
    Failed,
    /// Finished, but a later failure rolled the shared transaction back.
    RolledBack,
    /// Not started because an earlier table failed.
    NotRun,
}

/// Summary for one table run.
#[derive(Debug, Clone, Serialize)]
pub struct TableResult {
    pub table: String,
    pub status: TableStatus,
    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_skipped: u64,
    pub records_errored: u64,
    pub records_written: u64,
    pub skipped_by_reason: BTreeMap<String, u64>,
    pub errors: Vec<String>,
    pub fields_nulled: u64,
    pub duration_seconds: f64,
    pub rows_per_second: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableResult {
    /// Placeholder for a table that never started.
    pub fn not_run(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            status: TableStatus::NotRun,
            records_processed: 0,
            records_inserted: 0,
            records_skipped: 0,
            records_errored: 0,
            records_written: 0,
            skipped_by_reason: BTreeMap::new(),
            errors: Vec::new(),
            fields_nulled: 0,
            duration_seconds: 0.0,
            rows_per_second: 0,
            error: None,
        }
    }

    /// processed == inserted + skipped + errored
    pub fn is_conserved(&self) -> bool {
        self.records_processed
            == self.records_inserted + self.records_skipped + self.records_errored
    }

    /// The transaction holding this table's writes was rolled back.
    ///
    /// Inserted rows move to `errored` under [`ROLLED_BACK_REASON`] and
    /// nothing counts as written.
    pub fn roll_back(&mut self) {
        if self.status == TableStatus::Completed {
            self.status = TableStatus::RolledBack;
        }
        if self.records_inserted > 0 {
            self.errors.push(format!(
                "{} rows {} with the transaction",
                self.records_inserted, ROLLED_BACK_REASON
            ));
            self.records_errored += self.records_inserted;
            self.records_inserted = 0;
        }
        self.records_written = 0;
        self.rows_per_second = 0;
    }
}

/// Tracks one table run.
pub struct ProgressTracker {
    table: String,
    counters: MigrationCounters,
    started: Instant,
    interval: u64,
    error_log_limit: usize,
    errors_logged: AtomicUsize,
    fields_nulled: AtomicU64,
    skip_reasons: Mutex<HashMap<String, u64>>,
    diagnostics: Mutex<Vec<String>>,
    observer: Option<ProgressObserver>,
}

impl ProgressTracker {
    pub fn new(table: impl Into<String>, interval: u64, error_log_limit: usize) -> Self {
        Self {
            table: table.into(),
            counters: MigrationCounters::default(),
            started: Instant::now(),
            interval: interval.max(1),
            error_log_limit,
            errors_logged: AtomicUsize::new(0),
            fields_nulled: AtomicU64::new(0),
            skip_reasons: Mutex::new(HashMap::new()),
            diagnostics: Mutex::new(Vec::new()),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Option<ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn counters(&self) -> &MigrationCounters {
        &self.counters
    }

    /// The extraction stream pulled one row from the driver.
    pub fn row_read(&self) {
        self.counters.increment(Counter::Read);
    }

    /// A row passed transformation and is on its way to a writer.
    pub fn row_accepted(&self) {
        let processed = self.counters.increment(Counter::Processed);
        self.maybe_report(processed);
    }

    /// A row was filtered out.
    pub fn row_skipped(&self, reason: &SkipReason) {
        self.counters.increment(Counter::Skipped);
        *self.skip_reasons.lock().entry(reason.to_string()).or_insert(0) += 1;
        let processed = self.counters.increment(Counter::Processed);
        self.maybe_report(processed);
    }

    /// A row failed to decode or transform. Only the first few are logged in detail.
    pub fn row_errored(&self, sequence: u64, error: &RowError) {
        self.counters.increment(Counter::Errored);
        let n = self.errors_logged.fetch_add(1, Ordering::Relaxed);
        if n < self.error_log_limit {
            let message = truncate(&format!("row {}: {}", sequence, error));
            warn!("{}: {}", self.table, message);
            self.diagnostics.lock().push(message);
        } else if n == self.error_log_limit {
            warn!(
                "{}: more than {} row errors, further details suppressed",
                self.table, self.error_log_limit
            );
        }
        let processed = self.counters.increment(Counter::Processed);
        self.maybe_report(processed);
    }

    /// A writer committed records covering `source_rows` source rows.
    pub fn rows_inserted(&self, source_rows: u64, records: u64) {
        self.counters.add(Counter::Inserted, source_rows);
        self.counters.add(Counter::Written, records);
    }

    /// Non-mandatory large fields replaced by NULL.
    pub fn fields_nulled(&self, n: u64) {
        if n > 0 {
            self.fields_nulled.fetch_add(n, Ordering::Relaxed);
        }
    }

    fn maybe_report(&self, processed: u64) {
        if processed % self.interval == 0 {
            let event = self.event(false);
            info!(
                "{}: {} processed, {} inserted, {} skipped, {} errored ({} rows/sec)",
                self.table,
                event.processed,
                event.inserted,
                event.skipped,
                event.errored,
                event.rows_per_second
            );
            self.notify(&event);
        }
    }

    fn notify(&self, event: &ProgressEvent) {
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }

    fn event(&self, done: bool) -> ProgressEvent {
        let snap = self.counters.snapshot();
        let elapsed = self.started.elapsed().as_secs_f64();
        ProgressEvent {
            table: self.table.clone(),
            processed: snap.processed,
            inserted: snap.inserted,
            skipped: snap.skipped,
            errored: snap.errored,
            elapsed_seconds: elapsed,
            rows_per_second: rate(snap.processed, elapsed),
            done,
        }
    }

    /// Close the run and build its result.
    ///
    /// A failed run counts every row the extraction stream read as processed,
    /// and folds rows that never reached a verdict into `errored` under
    /// [`ABORTED_REASON`], so the counters still add up.
    pub fn finish(&self, status: TableStatus, error: Option<String>) -> TableResult {
        let mut snap = self.counters.snapshot();
        let mut skipped_by_reason: BTreeMap<String, u64> =
            self.skip_reasons.lock().iter().map(|(k, v)| (k.clone(), *v)).collect();
        let mut errors = self.diagnostics.lock().clone();

        if status != TableStatus::Completed {
            snap.processed = snap.processed.max(snap.read);
            let lost = snap.unaccounted();
            if lost > 0 {
                snap.errored += lost;
                errors.push(format!("{} rows {} by run failure", lost, ABORTED_REASON));
            }
        }
        skipped_by_reason.retain(|_, v| *v > 0);

        let elapsed = self.started.elapsed().as_secs_f64();
        let final_event = ProgressEvent {
            table: self.table.clone(),
            processed: snap.processed,
            inserted: snap.inserted,
            skipped: snap.skipped,
            errored: snap.errored,
            elapsed_seconds: elapsed,
            rows_per_second: rate(snap.inserted, elapsed),
            done: true,
        };
        self.notify(&final_event);

        TableResult {
            table: self.table.clone(),
            status,
            records_processed: snap.processed,
            records_inserted: snap.inserted,
            records_skipped: snap.skipped,
            records_errored: snap.errored,
            records_written: snap.written,
            skipped_by_reason,
            errors,
            fields_nulled: self.fields_nulled.load(Ordering::Relaxed),
            duration_seconds: elapsed,
            rows_per_second: final_event.rows_per_second,
            error,
        }
    }
}

fn rate(rows: u64, elapsed_secs: f64) -> i64 {
    if elapsed_secs > 0.0 {
        (rows as f64 / elapsed_secs) as i64
    } else {
        0
    }
}

fn truncate(message: &str) -> String {
    if message.len() <= MAX_DIAGNOSTIC_LEN {
        return message.to_string();
    }
    let mut end = MAX_DIAGNOSTIC_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}
