//! PostgreSQL binary COPY framing and `SqlValue` parameter binding.
//!
//! Field payloads use the `tokio_postgres` binary encodings, so COPY data and
//! bound parameters share one code path per type.

use std::error::Error;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

use crate::core::{Batch, SqlType, SqlValue, TargetRecord};
use crate::mapping::TargetColumn;

const COPY_SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

/// Postgres wire type for a declared column type.
pub fn pg_type(ty: SqlType) -> Type {
    match ty {
        SqlType::Bool => Type::BOOL,
        SqlType::I16 => Type::INT2,
        SqlType::I32 => Type::INT4,
        SqlType::I64 => Type::INT8,
        SqlType::F32 => Type::FLOAT4,
        SqlType::F64 => Type::FLOAT8,
        SqlType::Text => Type::TEXT,
        SqlType::Bytes => Type::BYTEA,
        SqlType::Uuid => Type::UUID,
        SqlType::Decimal => Type::NUMERIC,
        SqlType::DateTime => Type::TIMESTAMP,
        SqlType::DateTimeOffset => Type::TIMESTAMPTZ,
        SqlType::Date => Type::DATE,
        SqlType::Time => Type::TIME,
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            SqlValue::Null(_) => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::I16(v) => v.to_sql(ty, out),
            SqlValue::I32(v) => v.to_sql(ty, out),
            SqlValue::I64(v) => v.to_sql(ty, out),
            SqlValue::F32(v) => v.to_sql(ty, out),
            SqlValue::F64(v) => v.to_sql(ty, out),
            SqlValue::Text(v) => v.as_str().to_sql(ty, out),
            SqlValue::Bytes(v) => v.as_slice().to_sql(ty, out),
            SqlValue::Uuid(v) => v.to_sql(ty, out),
            SqlValue::Decimal(v) => v.to_sql(ty, out),
            SqlValue::DateTime(v) => v.to_sql(ty, out),
            SqlValue::DateTimeOffset(v) => v.to_sql(ty, out),
            SqlValue::Date(v) => v.to_sql(ty, out),
            SqlValue::Time(v) => v.to_sql(ty, out),
        }
    }

    // Values are coerced to the declared column type before they get here.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Incremental encoder for one `COPY ... FROM STDIN WITH (FORMAT BINARY)` stream.
///
/// The header is written on construction; [`finish`](Self::finish) appends
/// the trailer. Encoded bytes can be drained with [`take`](Self::take) at any
/// row boundary.
pub struct CopyEncoder {
    types: Vec<Type>,
    buf: BytesMut,
    rows: u64,
}

impl CopyEncoder {
    pub fn new(columns: &[TargetColumn]) -> Self {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        buf.put_slice(COPY_SIGNATURE);
        buf.put_i32(0); // flags
        buf.put_i32(0); // header extension length
        Self {
            types: columns.iter().map(|c| pg_type(c.ty)).collect(),
            buf,
            rows: 0,
        }
    }

    /// Append one tuple. On error the buffer is left at the previous row boundary.
    pub fn encode(&mut self, record: &TargetRecord) -> Result<(), String> {
        if record.len() != self.types.len() {
            return Err(format!(
                "record has {} values, table has {} columns",
                record.len(),
                self.types.len()
            ));
        }

        let Self { types, buf, rows } = self;
        let row_start = buf.len();
        buf.put_i16(types.len() as i16);
        for (value, ty) in record.values().iter().zip(types.iter()) {
            if let Err(e) = encode_field(buf, value, ty) {
                buf.truncate(row_start);
                return Err(e);
            }
        }
        *rows += 1;
        Ok(())
    }

    pub fn encode_batch(&mut self, batch: &Batch) -> Result<(), String> {
        batch.records.iter().try_for_each(|r| self.encode(r))
    }

    /// Drain the bytes encoded so far.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Append the trailer and drain the remainder.
    pub fn finish(mut self) -> Bytes {
        self.buf.put_i16(-1);
        self.buf.freeze()
    }

    /// Tuples encoded so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Length-prefixed field payload; -1 marks NULL.
fn encode_field(buf: &mut BytesMut, value: &SqlValue, ty: &Type) -> Result<(), String> {
    let len_pos = buf.len();
    buf.put_i32(0);
    let start = buf.len();
    let is_null = value
        .to_sql(ty, buf)
        .map_err(|e| format!("cannot encode {} as {}: {}", value.sql_type(), ty, e))?;
    let len = match is_null {
        IsNull::Yes => -1,
        IsNull::No => i32::try_from(buf.len() - start)
            .map_err(|_| "field exceeds the COPY length limit".to_string())?,
    };
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}
