//! Row and batch types flowing through the pipeline.

use super::value::SqlValue;

/// One record read from the source, addressed by declared ordinal.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    values: Vec<SqlValue>,
    sequence: u64,
}

impl SourceRow {
    pub fn new(values: Vec<SqlValue>, sequence: u64) -> Self {
        Self { values, sequence }
    }

    /// Value at a declared ordinal.
    pub fn get(&self, ordinal: usize) -> Option<&SqlValue> {
        self.values.get(ordinal)
    }

    /// Position of this row in extraction order, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A fully built row for the target table, one value per target column in
/// column order.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRecord {
    values: Box<[SqlValue]>,
}

impl TargetRecord {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self {
            values: values.into_boxed_slice(),
        }
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// An ordered run of records for one destination table.
///
/// `source_rows` counts the source rows these records came from. With fan-out
/// it is smaller than `records.len()`; inserted counters are kept in source rows.
#[derive(Debug, Default)]
pub struct Batch {
    pub records: Vec<TargetRecord>,
    pub source_rows: u64,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            source_rows: 0,
        }
    }

    /// Append every record produced by one source row.
    pub fn push_row(&mut self, records: Vec<TargetRecord>) {
        self.records.extend(records);
        self.source_rows += 1;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Empty the batch while keeping its allocation.
    pub fn clear(&mut self) {
        self.records.clear();
        self.source_rows = 0;
    }
}
