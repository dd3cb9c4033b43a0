//! Sequential, ordinal-addressed row decoding.
//!
//! Drivers that stream large values require columns to be read strictly left
//! to right, each at most once. [`RowDecoder`] owns that discipline: it walks
//! the declared columns in order and reads every one of them exactly once per
//! row, even when an earlier column already decided the row will be rejected.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{SqlType, SqlValue};
use crate::error::RowError;
use crate::mapping::SourceColumn;
use crate::transform::SkipReason;

/// Positional access to the current driver row.
pub trait ColumnAccess {
    /// Read a fixed-size value. NULL is returned as `SqlValue::Null(ty)`.
    fn scalar(&mut self, ordinal: usize, ty: SqlType) -> std::result::Result<SqlValue, String>;

    /// Read a large text or binary value.
    fn large(&mut self, ordinal: usize, ty: SqlType) -> std::result::Result<LargeValue<'_>, String>;
}

/// A large value as the driver delivers it.
#[derive(Debug, PartialEq, Eq)]
pub enum LargeValue<'a> {
    Null,
    Present(&'a [u8]),
    /// The source held the value back because it is over the ceiling.
    Withheld { size: u64 },
}

/// Size limit for large values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobPolicy {
    /// Largest value kept in memory, in bytes.
    pub max_bytes: usize,
}

impl Default for BlobPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

impl BlobPolicy {
    pub fn admits(&self, size: u64) -> bool {
        size <= self.max_bytes as u64
    }
}

/// A decoded row, or the reason it is rejected before transformation.
#[derive(Debug, PartialEq)]
pub enum DecodedRow {
    Row(Vec<SqlValue>),
    Rejected(SkipReason),
}

/// Decoder for the declared column list of one table.
pub struct RowDecoder<'a> {
    columns: &'a [SourceColumn],
    blob: BlobPolicy,
    fields_nulled: u64,
}

impl<'a> RowDecoder<'a> {
    pub fn new(columns: &'a [SourceColumn], blob: BlobPolicy) -> Self {
        Self {
            columns,
            blob,
            fields_nulled: 0,
        }
    }

    /// Non-mandatory large fields replaced by NULL since the last call.
    pub fn take_fields_nulled(&mut self) -> u64 {
        std::mem::take(&mut self.fields_nulled)
    }

    /// Decode the current row. Every declared column is consumed, in order,
    /// regardless of the outcome.
    pub fn decode<A: ColumnAccess + ?Sized>(
        &mut self,
        access: &mut A,
    ) -> std::result::Result<DecodedRow, RowError> {
        let mut values = Vec::with_capacity(self.columns.len());
        let mut first_error: Option<RowError> = None;
        let mut rejection: Option<SkipReason> = None;
        let columns = self.columns;

        for (ordinal, column) in columns.iter().enumerate() {
            let read = if column.ty.is_large() {
                self.read_large(access, ordinal, column)
            } else {
                access.scalar(ordinal, column.ty).map(Some)
            };

            match read {
                Ok(Some(value)) => values.push(value),
                Ok(None) => {
                    if column.mandatory {
                        rejection.get_or_insert_with(|| SkipReason::BlobTooLarge(column.name.clone()));
                    } else {
                        self.fields_nulled += 1;
                    }
                    values.push(SqlValue::Null(column.ty));
                }
                Err(message) => {
                    first_error.get_or_insert_with(|| RowError::conversion(&column.name, message));
                    values.push(SqlValue::Null(column.ty));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        match rejection {
            Some(reason) => Ok(DecodedRow::Rejected(reason)),
            None => Ok(DecodedRow::Row(values)),
        }
    }

    /// `Ok(None)` means the value exceeded the ceiling.
    fn read_large<A: ColumnAccess + ?Sized>(
        &self,
        access: &mut A,
        ordinal: usize,
        column: &SourceColumn,
    ) -> std::result::Result<Option<SqlValue>, String> {
        let raw = match access.large(ordinal, column.ty)? {
            LargeValue::Null => return Ok(Some(SqlValue::Null(column.ty))),
            LargeValue::Present(raw) if self.blob.admits(raw.len() as u64) => raw,
            LargeValue::Present(raw) => return Ok(self.oversized(column, raw.len() as u64)),
            LargeValue::Withheld { size } => return Ok(self.oversized(column, size)),
        };
        match column.ty {
            SqlType::Text => {
                let text = std::str::from_utf8(raw).map_err(|e| format!("invalid utf-8: {}", e))?;
                // PostgreSQL text cannot hold NUL.
                if text.contains('\0') {
                    return Err("text contains a NUL character".to_string());
                }
                Ok(Some(SqlValue::Text(text.to_string())))
            }
            _ => Ok(Some(SqlValue::Bytes(raw.to_vec()))),
        }
    }

    fn oversized(&self, column: &SourceColumn, size: u64) -> Option<SqlValue> {
        debug!(
            "Column '{}' value of {} bytes exceeds the {} byte ceiling",
            column.name, size, self.blob.max_bytes
        );
        None
    }
}

/// Column access over an already materialized row, enforcing forward-only reads.
pub struct ValueAccess<'r> {
    values: &'r [SqlValue],
    next: usize,
}

impl<'r> ValueAccess<'r> {
    pub fn new(values: &'r [SqlValue]) -> Self {
        Self { values, next: 0 }
    }

    fn advance(&mut self, ordinal: usize) -> std::result::Result<&'r SqlValue, String> {
        if ordinal < self.next {
            return Err(format!(
                "column {} read after column {}",
                ordinal,
                self.next.saturating_sub(1)
            ));
        }
        self.next = ordinal + 1;
        self.values
            .get(ordinal)
            .ok_or_else(|| format!("column {} is missing from the row", ordinal))
    }
}

impl ColumnAccess for ValueAccess<'_> {
    fn scalar(&mut self, ordinal: usize, ty: SqlType) -> std::result::Result<SqlValue, String> {
        self.advance(ordinal)?.clone().coerce(ty)
    }

    fn large(&mut self, ordinal: usize, ty: SqlType) -> std::result::Result<LargeValue<'_>, String> {
        match self.advance(ordinal)? {
            SqlValue::Null(_) => Ok(LargeValue::Null),
            SqlValue::Bytes(b) => Ok(LargeValue::Present(b.as_slice())),
            SqlValue::Text(s) => Ok(LargeValue::Present(s.as_bytes())),
            other => Err(format!("expected {} but found {}", ty, other.sql_type())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<SourceColumn> {
        vec![
            SourceColumn {
                name: "Id".into(),
                ty: SqlType::I32,
                mandatory: false,
            },
            SourceColumn {
                name: "Attachment".into(),
                ty: SqlType::Bytes,
                mandatory: false,
            },
            SourceColumn {
                name: "Body".into(),
                ty: SqlType::Text,
                mandatory: true,
            },
        ]
    }

    /// Records the order columns are read in.
    struct Recording<'r> {
        inner: ValueAccess<'r>,
        reads: Vec<usize>,
    }

    impl ColumnAccess for Recording<'_> {
        fn scalar(&mut self, ordinal: usize, ty: SqlType) -> std::result::Result<SqlValue, String> {
            self.reads.push(ordinal);
            self.inner.scalar(ordinal, ty)
        }

        fn large(
            &mut self,
            ordinal: usize,
            ty: SqlType,
        ) -> std::result::Result<LargeValue<'_>, String> {
            self.reads.push(ordinal);
            self.inner.large(ordinal, ty)
        }
    }

    /// Stands in for a source that reports oversized values by size only.
    struct Withholding {
        sizes: Vec<u64>,
        next: usize,
    }

    impl ColumnAccess for Withholding {
        fn scalar(&mut self, ordinal: usize, _ty: SqlType) -> std::result::Result<SqlValue, String> {
            self.next = ordinal + 1;
            Ok(SqlValue::I32(ordinal as i32))
        }

        fn large(
            &mut self,
            ordinal: usize,
            _ty: SqlType,
        ) -> std::result::Result<LargeValue<'_>, String> {
            self.next = ordinal + 1;
            Ok(LargeValue::Withheld {
                size: self.sizes[ordinal - 1],
            })
        }
    }

    #[test]
    fn test_blob_policy_ceiling_is_inclusive() {
        let policy = BlobPolicy { max_bytes: 10 };
        assert!(policy.admits(0));
        assert!(policy.admits(10));
        assert!(!policy.admits(11));
    }

    #[test]
    fn test_withheld_values_follow_mandatory_rules() {
        let cols = columns();
        let mut decoder = RowDecoder::new(&cols, BlobPolicy { max_bytes: 4 });
        let mut access = Withholding {
            sizes: vec![5_000_000, 9],
            next: 0,
        };
        let decoded = decoder.decode(&mut access).unwrap();
        assert_eq!(decoded, DecodedRow::Rejected(SkipReason::BlobTooLarge("Body".into())));
        assert_eq!(access.next, 3);
        assert_eq!(decoder.take_fields_nulled(), 1);
    }

    #[test]
    fn test_oversized_optional_blob_becomes_null() {
        let cols = columns();
        let mut decoder = RowDecoder::new(
            &cols,
            BlobPolicy { max_bytes: 4 },
        );
        let values = vec![SqlValue::I32(1), SqlValue::Bytes(vec![0; 8]), SqlValue::from("ok")];
        let decoded = decoder.decode(&mut ValueAccess::new(&values)).unwrap();
        assert_eq!(
            decoded,
            DecodedRow::Row(vec![
                SqlValue::I32(1),
                SqlValue::Null(SqlType::Bytes),
                SqlValue::from("ok")
            ])
        );
        assert_eq!(decoder.take_fields_nulled(), 1);
        assert_eq!(decoder.take_fields_nulled(), 0);
    }

    #[test]
    fn test_oversized_mandatory_rejects_row_after_reading_all_columns() {
        let cols = columns();
        let mut decoder = RowDecoder::new(
            &cols,
            BlobPolicy { max_bytes: 4 },
        );
        let values = vec![SqlValue::I32(1), SqlValue::Bytes(vec![0; 8]), SqlValue::from("too long")];
        let mut access = Recording {
            inner: ValueAccess::new(&values),
            reads: Vec::new(),
        };
        let decoded = decoder.decode(&mut access).unwrap();
        assert_eq!(decoded, DecodedRow::Rejected(SkipReason::BlobTooLarge("Body".into())));
        assert_eq!(access.reads, vec![0, 1, 2]);
    }

    #[test]
    fn test_conversion_error_still_consumes_every_column() {
        let cols = columns();
        let mut decoder = RowDecoder::new(&cols, BlobPolicy::default());
        let values = vec![SqlValue::from("x"), SqlValue::Bytes(vec![1]), SqlValue::from("b")];
        let mut access = Recording {
            inner: ValueAccess::new(&values),
            reads: Vec::new(),
        };
        let err = decoder.decode(&mut access).unwrap_err();
        assert!(matches!(err, RowError::Conversion { ref column, .. } if column == "Id"));
        assert_eq!(access.reads, vec![0, 1, 2]);
    }

    #[test]
    fn test_nul_in_text_is_a_row_error() {
        let cols = columns();
        let mut decoder = RowDecoder::new(&cols, BlobPolicy::default());
        let values = vec![SqlValue::I32(1), SqlValue::Null(SqlType::Bytes), SqlValue::from("a\0b")];
        let err = decoder.decode(&mut ValueAccess::new(&values)).unwrap_err();
        assert!(matches!(err, RowError::Conversion { ref column, .. } if column == "Body"));
    }

    #[test]
    fn test_value_access_is_forward_only() {
        let values = vec![SqlValue::I32(1), SqlValue::I32(2)];
        let mut access = ValueAccess::new(&values);
        assert!(access.scalar(1, SqlType::I32).is_ok());
        assert!(access.scalar(0, SqlType::I32).is_err());
    }
}
