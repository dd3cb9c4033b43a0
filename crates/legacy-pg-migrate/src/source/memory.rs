//! In-memory source, keyed by SELECT text. Used for dry runs and tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BlobPolicy, RowDecoder, RowSink, SourceReader, ValueAccess};
use crate::core::SqlValue;
use crate::error::{MigrateError, Result};
use crate::mapping::CompiledTable;

#[derive(Default)]
pub struct MemorySource {
    results: Mutex<HashMap<String, Vec<Vec<SqlValue>>>>,
    fail_after: Mutex<Option<(String, u64)>>,
    row_delay: Option<Duration>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows returned for a SELECT statement.
    pub fn with_rows(self, select: impl Into<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        self.results.lock().insert(select.into(), rows);
        self
    }

    /// Sleep between rows to model a slow producer.
    pub fn with_row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = Some(delay);
        self
    }

    /// Fail the stream for `select` after `rows` rows were delivered.
    pub fn fail_after(self, select: impl Into<String>, rows: u64) -> Self {
        *self.fail_after.lock() = Some((select.into(), rows));
        self
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn stream_rows(
        &self,
        table: &CompiledTable,
        blob: BlobPolicy,
        sink: &mut RowSink,
    ) -> Result<u64> {
        let rows = self.results.lock().get(&table.select).cloned().ok_or_else(|| {
            MigrateError::transfer(&table.name, format!("no rows registered for: {}", table.select))
        })?;
        let fail_at = self
            .fail_after
            .lock()
            .as_ref()
            .filter(|(select, _)| *select == table.select)
            .map(|(_, n)| *n);

        let mut decoder = RowDecoder::new(&table.source_columns, blob);
        let mut read = 0u64;
        for values in rows {
            if fail_at == Some(read) {
                return Err(MigrateError::transfer(&table.name, "source connection lost"));
            }
            let decoded = decoder.decode(&mut ValueAccess::new(&values));
            let nulled = decoder.take_fields_nulled();
            sink.accept(decoded, nulled).await?;
            read += 1;
            if let Some(delay) = self.row_delay {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(read)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}
