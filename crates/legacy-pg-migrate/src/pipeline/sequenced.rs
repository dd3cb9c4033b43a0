//! Ordered insert-or-update path for tables keyed by a logical key.
//!
//! Runs on a single task so rows are applied in extraction order. Records are
//! coalesced per key inside a window of `window` source rows (last write
//! wins) and each window is applied as one atomic upsert.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::BoundedQueue;
use crate::core::{SourceRow, TargetRecord};
use crate::error::{MigrateError, Result, RowError};
use crate::mapping::{CompiledTable, CompiledWrite};
use crate::progress::ProgressTracker;
use crate::reference::ReferenceKey;
use crate::target::TargetStore;
use crate::transform::{RowTransformer, TransformOutcome};

pub struct SequencedUpsert {
    store: Arc<dyn TargetStore>,
    table: Arc<CompiledTable>,
    transformer: Arc<dyn RowTransformer>,
    raw: BoundedQueue<SourceRow>,
    tracker: Arc<ProgressTracker>,
    window: usize,
}

/// Records waiting for the next flush, in first-seen key order.
#[derive(Default)]
struct Window {
    records: Vec<TargetRecord>,
    slots: HashMap<ReferenceKey, usize>,
    source_rows: u64,
}

impl Window {
    fn put(&mut self, key: ReferenceKey, record: TargetRecord) {
        match self.slots.get(&key) {
            Some(&slot) => self.records[slot] = record,
            None => {
                self.slots.insert(key, self.records.len());
                self.records.push(record);
            }
        }
    }

    fn clear(&mut self) {
        self.records.clear();
        self.slots.clear();
        self.source_rows = 0;
    }
}

impl SequencedUpsert {
    pub fn new(
        store: Arc<dyn TargetStore>,
        table: Arc<CompiledTable>,
        transformer: Arc<dyn RowTransformer>,
        raw: BoundedQueue<SourceRow>,
        tracker: Arc<ProgressTracker>,
        window: usize,
    ) -> Self {
        Self {
            store,
            table,
            transformer,
            raw,
            tracker,
            window: window.max(1),
        }
    }

    /// Apply every row. Returns the number of records upserted.
    pub async fn run(self) -> Result<u64> {
        let (key_columns, key_indexes, sequence_ordinal) = match &self.table.write {
            CompiledWrite::Upsert {
                key_columns,
                key_indexes,
                sequence_ordinal,
            } => (key_columns.clone(), key_indexes.clone(), *sequence_ordinal),
            CompiledWrite::Bulk => {
                return Err(MigrateError::Config(format!(
                    "table '{}' is not an upsert table",
                    self.table.name
                )))
            }
        };

        let mut window = Window::default();
        let mut last_sequence: Option<ReferenceKey> = None;
        let mut written = 0u64;

        while let Some(row) = self.raw.take().await? {
            if let Some(ordinal) = sequence_ordinal {
                let current = row
                    .get(ordinal)
                    .and_then(ReferenceKey::from_value)
                    .ok_or_else(|| self.ordering_error(row.sequence(), "sequence value is NULL"))?;
                if let Some(previous) = &last_sequence {
                    if current < *previous {
                        return Err(self.ordering_error(
                            row.sequence(),
                            &format!("sequence went from {} back to {}", previous, current),
                        ));
                    }
                }
                last_sequence = Some(current);
            }

            match self.transformer.transform(&row) {
                Ok(TransformOutcome::Emit(records)) => {
                    match keyed(records, &key_indexes, &key_columns) {
                        Ok(keyed) => {
                            for (key, record) in keyed {
                                window.put(key, record);
                            }
                            window.source_rows += 1;
                            self.tracker.row_accepted();
                        }
                        Err(e) => self.tracker.row_errored(row.sequence(), &e),
                    }
                }
                Ok(TransformOutcome::Skip(reason)) => self.tracker.row_skipped(&reason),
                Err(e) => self.tracker.row_errored(row.sequence(), &e),
            }

            if window.source_rows as usize >= self.window {
                written += self.flush(&mut window, &key_columns).await?;
            }
        }

        written += self.flush(&mut window, &key_columns).await?;
        Ok(written)
    }

    async fn flush(&self, window: &mut Window, key_columns: &[String]) -> Result<u64> {
        if window.records.is_empty() {
            window.clear();
            return Ok(0);
        }
        let n = self
            .store
            .upsert(&self.table.target, key_columns, &window.records)
            .await?;
        self.tracker
            .rows_inserted(window.source_rows, window.records.len() as u64);
        debug!(
            "{}: upserted {} records for {} rows",
            self.table.name,
            window.records.len(),
            window.source_rows
        );
        window.clear();
        Ok(n)
    }

    fn ordering_error(&self, sequence: u64, message: &str) -> MigrateError {
        MigrateError::Ordering {
            table: self.table.name.clone(),
            message: format!("row {}: {}", sequence, message),
        }
    }
}

/// Pair each record with its logical key. A NULL key part fails the whole row.
fn keyed(
    records: Vec<TargetRecord>,
    key_indexes: &[usize],
    key_columns: &[String],
) -> std::result::Result<Vec<(ReferenceKey, TargetRecord)>, RowError> {
    records
        .into_iter()
        .map(|record| {
            let parts = key_indexes.iter().filter_map(|&i| record.get(i));
            match ReferenceKey::from_values(parts) {
                Some(key) => Ok((key, record)),
                None => Err(RowError::conversion(
                    key_columns.join(","),
                    "upsert key is NULL",
                )),
            }
        })
        .collect()
}
