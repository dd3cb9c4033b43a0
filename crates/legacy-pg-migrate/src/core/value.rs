//! SQL value types shared by the source reader, the transformer and the writers.
//!
//! Values are owned: a [`SourceRow`](super::SourceRow) must not borrow from the
//! driver buffer it was decoded from, and a target record must not borrow from
//! its source row.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declared column type, on either side of a mapping.
///
/// Also serves as the type hint carried by NULL values so that binary encoders
/// and parameter binding know which wire type to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    #[serde(alias = "bit", alias = "boolean")]
    Bool,
    #[serde(alias = "smallint", alias = "tinyint")]
    I16,
    #[serde(alias = "int", alias = "integer")]
    I32,
    #[serde(alias = "bigint")]
    I64,
    #[serde(alias = "real")]
    F32,
    #[serde(alias = "float", alias = "double")]
    F64,
    #[serde(alias = "varchar", alias = "nvarchar", alias = "string")]
    Text,
    #[serde(alias = "varbinary", alias = "bytea", alias = "blob")]
    Bytes,
    #[serde(alias = "uniqueidentifier")]
    Uuid,
    #[serde(alias = "numeric", alias = "money")]
    Decimal,
    #[serde(alias = "datetime2", alias = "timestamp")]
    DateTime,
    #[serde(alias = "timestamptz")]
    DateTimeOffset,
    Date,
    Time,
}

impl SqlType {
    /// Types read through the chunked large-value path.
    pub fn is_large(&self) -> bool {
        matches!(self, SqlType::Bytes | SqlType::Text)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, SqlType::I16 | SqlType::I32 | SqlType::I64)
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlType::Bool => "bool",
            SqlType::I16 => "i16",
            SqlType::I32 => "i32",
            SqlType::I64 => "i64",
            SqlType::F32 => "f32",
            SqlType::F64 => "f64",
            SqlType::Text => "text",
            SqlType::Bytes => "bytes",
            SqlType::Uuid => "uuid",
            SqlType::Decimal => "decimal",
            SqlType::DateTime => "datetime",
            SqlType::DateTimeOffset => "datetimeoffset",
            SqlType::Date => "date",
            SqlType::Time => "time",
        };
        f.write_str(name)
    }
}

/// A single typed, nullable field value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with type hint for correct wire format encoding.
    Null(SqlType),
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Decimal(Decimal),
    /// Timestamp without timezone.
    DateTime(NaiveDateTime),
    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// The type of this value (the hint, for NULL).
    #[must_use]
    pub fn sql_type(&self) -> SqlType {
        match self {
            SqlValue::Null(t) => *t,
            SqlValue::Bool(_) => SqlType::Bool,
            SqlValue::I16(_) => SqlType::I16,
            SqlValue::I32(_) => SqlType::I32,
            SqlValue::I64(_) => SqlType::I64,
            SqlValue::F32(_) => SqlType::F32,
            SqlValue::F64(_) => SqlType::F64,
            SqlValue::Text(_) => SqlType::Text,
            SqlValue::Bytes(_) => SqlType::Bytes,
            SqlValue::Uuid(_) => SqlType::Uuid,
            SqlValue::Decimal(_) => SqlType::Decimal,
            SqlValue::DateTime(_) => SqlType::DateTime,
            SqlValue::DateTimeOffset(_) => SqlType::DateTimeOffset,
            SqlValue::Date(_) => SqlType::Date,
            SqlValue::Time(_) => SqlType::Time,
        }
    }

    /// Integer view of the value, if it has one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I16(v) => Some(i64::from(*v)),
            SqlValue::I32(v) => Some(i64::from(*v)),
            SqlValue::I64(v) => Some(*v),
            SqlValue::Bool(v) => Some(i64::from(*v)),
            SqlValue::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Truthiness used by conditional rules: NULL, false, zero and empty text are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            SqlValue::Null(_) => false,
            SqlValue::Bool(v) => *v,
            SqlValue::I16(v) => *v != 0,
            SqlValue::I32(v) => *v != 0,
            SqlValue::I64(v) => *v != 0,
            SqlValue::F32(v) => *v != 0.0,
            SqlValue::F64(v) => *v != 0.0,
            SqlValue::Decimal(d) => !d.is_zero(),
            SqlValue::Text(s) => !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"),
            SqlValue::Bytes(b) => !b.is_empty(),
            _ => true,
        }
    }

    /// Text rendering, `None` for NULL.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null(_) => None,
            SqlValue::Text(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Convert the value to the given type.
    ///
    /// NULL converts to NULL of the new type. Narrowing integer conversions
    /// are range checked. The error message is the reason only; callers attach
    /// the column name.
    pub fn coerce(self, to: SqlType) -> std::result::Result<SqlValue, String> {
        if self.sql_type() == to {
            return Ok(self);
        }
        let from = self.sql_type();
        let fail = |detail: &str| format!("cannot convert {} to {}: {}", from, to, detail);

        let value = match (self, to) {
            (SqlValue::Null(_), t) => SqlValue::Null(t),

            (v, SqlType::Text) => SqlValue::Text(v.to_string()),

            (v, SqlType::I16) => {
                let n = v.as_i64().ok_or_else(|| fail("not an integer"))?;
                SqlValue::I16(i16::try_from(n).map_err(|_| fail("out of range"))?)
            }
            (v, SqlType::I32) => {
                let n = v.as_i64().ok_or_else(|| fail("not an integer"))?;
                SqlValue::I32(i32::try_from(n).map_err(|_| fail("out of range"))?)
            }
            (v, SqlType::I64) => SqlValue::I64(v.as_i64().ok_or_else(|| fail("not an integer"))?),

            (SqlValue::Text(s), SqlType::Bool) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "t" | "y" | "yes" => SqlValue::Bool(true),
                "0" | "false" | "f" | "n" | "no" => SqlValue::Bool(false),
                _ => return Err(fail("not a boolean")),
            },
            (v, SqlType::Bool) => match v.as_i64() {
                Some(n) => SqlValue::Bool(n != 0),
                None => return Err(fail("not a boolean")),
            },

            (SqlValue::F32(f), SqlType::F64) => SqlValue::F64(f64::from(f)),
            (SqlValue::Decimal(d), SqlType::F64) => {
                SqlValue::F64(d.to_f64().ok_or_else(|| fail("out of range"))?)
            }
            (SqlValue::Decimal(d), SqlType::F32) => {
                SqlValue::F32(d.to_f32().ok_or_else(|| fail("out of range"))?)
            }
            (SqlValue::F64(f), SqlType::F32) => SqlValue::F32(f as f32),
            (SqlValue::Text(s), SqlType::F64) => {
                SqlValue::F64(s.trim().parse().map_err(|_| fail("not a number"))?)
            }
            (SqlValue::Text(s), SqlType::F32) => {
                SqlValue::F32(s.trim().parse().map_err(|_| fail("not a number"))?)
            }
            (v, SqlType::F64) if v.sql_type().is_integer() => {
                SqlValue::F64(v.as_i64().unwrap_or_default() as f64)
            }

            (SqlValue::F64(f), SqlType::Decimal) => {
                SqlValue::Decimal(Decimal::from_f64(f).ok_or_else(|| fail("not finite"))?)
            }
            (SqlValue::F32(f), SqlType::Decimal) => {
                SqlValue::Decimal(Decimal::from_f32(f).ok_or_else(|| fail("not finite"))?)
            }
            (SqlValue::Text(s), SqlType::Decimal) => {
                SqlValue::Decimal(s.trim().parse().map_err(|_| fail("not a decimal"))?)
            }
            (v, SqlType::Decimal) if v.sql_type().is_integer() => {
                SqlValue::Decimal(Decimal::from(v.as_i64().unwrap_or_default()))
            }

            (SqlValue::Text(s), SqlType::Uuid) => {
                SqlValue::Uuid(Uuid::parse_str(s.trim()).map_err(|e| fail(&e.to_string()))?)
            }
            (SqlValue::Bytes(b), SqlType::Uuid) => {
                SqlValue::Uuid(Uuid::from_slice(&b).map_err(|e| fail(&e.to_string()))?)
            }

            (SqlValue::Text(s), SqlType::Bytes) => SqlValue::Bytes(s.into_bytes()),

            (SqlValue::DateTimeOffset(dt), SqlType::DateTime) => SqlValue::DateTime(dt.naive_utc()),
            (SqlValue::DateTime(dt), SqlType::DateTimeOffset) => {
                SqlValue::DateTimeOffset(dt.and_utc().fixed_offset())
            }
            (SqlValue::DateTime(dt), SqlType::Date) => SqlValue::Date(dt.date()),
            (SqlValue::DateTimeOffset(dt), SqlType::Date) => SqlValue::Date(dt.date_naive()),
            (SqlValue::DateTime(dt), SqlType::Time) => SqlValue::Time(dt.time()),
            (SqlValue::Date(d), SqlType::DateTime) => SqlValue::DateTime(d.and_time(NaiveTime::MIN)),
            (SqlValue::Text(s), SqlType::DateTime) => SqlValue::DateTime(
                NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%dT%H:%M:%S%.f"))
                    .map_err(|e| fail(&e.to_string()))?,
            ),
            (SqlValue::Text(s), SqlType::DateTimeOffset) => SqlValue::DateTimeOffset(
                DateTime::parse_from_rfc3339(s.trim()).map_err(|e| fail(&e.to_string()))?,
            ),
            (SqlValue::Text(s), SqlType::Date) => SqlValue::Date(
                NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| fail(&e.to_string()))?,
            ),
            (SqlValue::Text(s), SqlType::Time) => SqlValue::Time(
                NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
                    .map_err(|e| fail(&e.to_string()))?,
            ),

            _ => return Err(fail("unsupported conversion")),
        };
        Ok(value)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null(_) => f.write_str("NULL"),
            SqlValue::Bool(v) => write!(f, "{}", v),
            SqlValue::I16(v) => write!(f, "{}", v),
            SqlValue::I32(v) => write!(f, "{}", v),
            SqlValue::I64(v) => write!(f, "{}", v),
            SqlValue::F32(v) => write!(f, "{}", v),
            SqlValue::F64(v) => write!(f, "{}", v),
            SqlValue::Text(v) => f.write_str(v),
            SqlValue::Bytes(v) => {
                f.write_str("\\x")?;
                for b in v {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            SqlValue::Uuid(v) => write!(f, "{}", v),
            SqlValue::Decimal(v) => write!(f, "{}", v),
            SqlValue::DateTime(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            SqlValue::DateTimeOffset(v) => write!(f, "{}", v.to_rfc3339()),
            SqlValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            SqlValue::Time(v) => write!(f, "{}", v.format("%H:%M:%S%.f")),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue
where
    T: TypedNull,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => SqlValue::Null(T::SQL_TYPE),
        }
    }
}

/// Rust types with a fixed SQL type, used for typed NULLs from `Option<T>`.
pub trait TypedNull {
    const SQL_TYPE: SqlType;
}

impl TypedNull for bool {
    const SQL_TYPE: SqlType = SqlType::Bool;
}
impl TypedNull for i32 {
    const SQL_TYPE: SqlType = SqlType::I32;
}
impl TypedNull for i64 {
    const SQL_TYPE: SqlType = SqlType::I64;
}
impl TypedNull for &str {
    const SQL_TYPE: SqlType = SqlType::Text;
}
impl TypedNull for String {
    const SQL_TYPE: SqlType = SqlType::Text;
}
impl TypedNull for Vec<u8> {
    const SQL_TYPE: SqlType = SqlType::Bytes;
}
