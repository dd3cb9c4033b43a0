//! Source side: the extraction stream.
//!
//! A [`SourceReader`] runs one table's SELECT on a single connection and
//! pushes decoded rows into the raw-row queue in extraction order. It is the
//! only producer of that queue.

mod decode;
mod memory;
mod mssql;

pub use decode::{BlobPolicy, ColumnAccess, DecodedRow, LargeValue, RowDecoder, ValueAccess};
pub use memory::MemorySource;
pub use mssql::MssqlSource;

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::SourceRow;
use crate::error::{Result, RowError};
use crate::mapping::CompiledTable;
use crate::pipeline::BoundedQueue;
use crate::progress::ProgressTracker;

/// Read rows from a source store.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Stream every row of `table.select` into `sink`.
    ///
    /// The sequence is forward-only and single-pass. Returns the number of
    /// rows read from the driver.
    async fn stream_rows(
        &self,
        table: &CompiledTable,
        blob: BlobPolicy,
        sink: &mut RowSink,
    ) -> Result<u64>;

    /// Check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Get the database type.
    fn db_type(&self) -> &str;
}

/// Where the extraction stream delivers decoded rows.
///
/// Assigns extraction sequence numbers and records rows rejected during
/// decoding, so that every row read is accounted for exactly once.
pub struct RowSink {
    queue: BoundedQueue<SourceRow>,
    tracker: Arc<ProgressTracker>,
    sequence: u64,
}

impl RowSink {
    pub fn new(queue: BoundedQueue<SourceRow>, tracker: Arc<ProgressTracker>) -> Self {
        Self {
            queue,
            tracker,
            sequence: 0,
        }
    }

    /// Hand one decoded row onward. Waits while the raw queue is full.
    pub async fn accept(
        &mut self,
        decoded: std::result::Result<DecodedRow, RowError>,
        fields_nulled: u64,
    ) -> Result<()> {
        self.sequence += 1;
        self.tracker.row_read();
        self.tracker.fields_nulled(fields_nulled);
        match decoded {
            Ok(DecodedRow::Row(values)) => {
                self.queue.put(SourceRow::new(values, self.sequence)).await?;
            }
            Ok(DecodedRow::Rejected(reason)) => self.tracker.row_skipped(&reason),
            Err(e) => self.tracker.row_errored(self.sequence, &e),
        }
        Ok(())
    }

    /// Rows accepted so far.
    pub fn rows_read(&self) -> u64 {
        self.sequence
    }
}
