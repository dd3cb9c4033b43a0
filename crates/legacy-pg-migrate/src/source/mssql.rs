//! MSSQL extraction stream over Tiberius with bb8 connection pooling.

use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BlobPolicy, ColumnAccess, LargeValue, RowDecoder, RowSink, SourceReader};
use crate::config::SourceConfig;
use crate::core::{SqlType, SqlValue};
use crate::error::{MigrateError, Result};
use crate::mapping::{CompiledTable, SourceColumn};

/// Connection acquisition timeout from pool (30 seconds).
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle connection timeout (5 minutes).
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// TCP keepalive interval (30 seconds).
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Connection manager for bb8 pool with Tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));

        if self.config.encrypt {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

fn io_error(e: std::io::Error) -> tiberius::error::Error {
    tiberius::error::Error::Io {
        kind: e.kind(),
        message: e.to_string(),
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(io_error)?;
        tcp.set_nodelay(true).ok();

        let std_tcp = tcp.into_std().map_err(io_error)?;
        let socket = socket2::Socket::from(std_tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on MSSQL connection: {}", e);
        }
        let std_tcp: std::net::TcpStream = socket.into();
        std_tcp.set_nonblocking(true).map_err(io_error)?;
        let tcp = TcpStream::from_std(std_tcp).map_err(io_error)?;

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Extraction stream over a pooled MSSQL connection.
pub struct MssqlSource {
    pool: Pool<TiberiusConnectionManager>,
}

impl MssqlSource {
    /// Connect and verify with a test query.
    pub async fn connect(config: &SourceConfig, max_size: u32) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_size.max(1))
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "creating MSSQL connection pool"))?;

        let source = Self { pool };
        source.ping().await?;

        info!(
            "Connected to MSSQL: {}:{}/{} (pool_size={})",
            config.host, config.port, config.database, max_size
        );
        Ok(source)
    }

    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "getting MSSQL connection"))
    }
}

#[async_trait]
impl SourceReader for MssqlSource {
    async fn stream_rows(
        &self,
        table: &CompiledTable,
        blob: BlobPolicy,
        sink: &mut RowSink,
    ) -> Result<u64> {
        let mut client = self.get_client().await?;
        let query = GuardedSelect::new(&table.select, &table.source_columns, blob.max_bytes);
        debug!("{}: {}", table.name, query.sql);

        let mut stream = client
            .simple_query(query.sql.as_str())
            .await?
            .into_row_stream();
        let mut decoder = RowDecoder::new(&table.source_columns, blob);
        let mut read = 0u64;

        while let Some(row) = stream.try_next().await? {
            if read == 0 {
                check_shape(table, &query, &row)?;
            }
            let decoded = decoder.decode(&mut TiberiusAccess::new(&row, &query));
            let nulled = decoder.take_fields_nulled();
            sink.accept(decoded, nulled).await?;
            read += 1;
        }

        Ok(read)
    }

    async fn ping(&self) -> Result<()> {
        let mut client = self.get_client().await?;
        client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mssql"
    }
}

/// The extraction query with large values capped at the source.
///
/// Each large column is NULLed by the server when its `DATALENGTH` exceeds
/// the ceiling, and is followed by a `BIGINT` companion carrying that length,
/// so an oversized value never crosses the wire. A trailing top-level
/// `ORDER BY` is lifted onto the outer query with its qualifiers dropped.
#[derive(Debug)]
struct GuardedSelect {
    sql: String,
    /// Result ordinal of each declared column.
    physical: Vec<usize>,
    /// Whether large columns carry a size companion.
    sized: bool,
    width: usize,
}

impl GuardedSelect {
    fn new(select: &str, columns: &[SourceColumn], max_bytes: usize) -> Self {
        if !columns.iter().any(|c| c.ty.is_large()) {
            return Self {
                sql: select.to_string(),
                physical: (0..columns.len()).collect(),
                sized: false,
                width: columns.len(),
            };
        }

        let (body, order_by) = split_order_by(select);
        let mut list = Vec::with_capacity(columns.len() + 1);
        let mut physical = Vec::with_capacity(columns.len());
        for column in columns {
            physical.push(list.len());
            let name = bracket(&column.name);
            if column.ty.is_large() {
                list.push(format!(
                    "CASE WHEN DATALENGTH([src].{name}) > {max_bytes} THEN NULL ELSE [src].{name} END AS {name}"
                ));
                list.push(format!(
                    "CAST(DATALENGTH([src].{name}) AS BIGINT) AS {}",
                    bracket(&format!("{}__size", column.name))
                ));
            } else {
                list.push(format!("[src].{name}"));
            }
        }

        let mut sql = format!("SELECT {} FROM ({}) AS [src]", list.join(", "), body);
        if let Some(order_by) = order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(&unqualify(order_by));
        }
        Self {
            width: list.len(),
            sql,
            physical,
            sized: true,
        }
    }
}

fn bracket(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Split off a trailing `ORDER BY` that sits outside parentheses and quotes.
fn split_order_by(select: &str) -> (&str, Option<&str>) {
    let select = select.trim().trim_end_matches(';').trim_end();
    let bytes = select.as_bytes();
    let mut depth = 0i32;
    let mut closing: Option<u8> = None;
    let mut found = None;

    for (i, &b) in bytes.iter().enumerate() {
        if let Some(q) = closing {
            if b == q {
                closing = None;
            }
            continue;
        }
        match b {
            b'\'' => closing = Some(b'\''),
            b'"' => closing = Some(b'"'),
            b'[' => closing = Some(b']'),
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ if depth == 0 => {
                if let Some(end) = order_by_at(bytes, i) {
                    found = Some((i, end));
                }
            }
            _ => {}
        }
    }

    match found {
        Some((start, end)) => (select[..start].trim_end(), Some(select[end..].trim())),
        None => (select, None),
    }
}

/// End offset of an `ORDER BY` keyword pair starting at `i`.
fn order_by_at(bytes: &[u8], i: usize) -> Option<usize> {
    let word = |b: &u8| b.is_ascii_alphanumeric() || *b == b'_';
    if i > 0 && word(&bytes[i - 1]) {
        return None;
    }
    let rest = &bytes[i..];
    if rest.len() < 5 || !rest[..5].eq_ignore_ascii_case(b"ORDER") {
        return None;
    }
    let gap = rest[5..].iter().take_while(|b| b.is_ascii_whitespace()).count();
    let by = 5 + gap;
    if gap == 0 || rest.len() < by + 2 || !rest[by..by + 2].eq_ignore_ascii_case(b"BY") {
        return None;
    }
    if rest.get(by + 2).is_some_and(word) {
        return None;
    }
    Some(i + by + 2)
}

/// `t.[Id] DESC, Name` becomes `[Id] DESC, Name`.
fn unqualify(order_by: &str) -> String {
    order_by
        .split(',')
        .map(|term| {
            let term = term.trim();
            let (expr, direction) = match term.split_once(char::is_whitespace) {
                Some((expr, direction)) => (expr, Some(direction.trim())),
                None => (term, None),
            };
            let expr = match expr.rfind('.') {
                Some(dot) if !expr.contains('(') => &expr[dot + 1..],
                _ => expr,
            };
            match direction {
                Some(direction) => format!("{} {}", expr, direction),
                None => expr.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validate the result shape once per stream, against the declared columns.
fn check_shape(table: &CompiledTable, query: &GuardedSelect, row: &Row) -> Result<()> {
    if row.len() != query.width {
        return Err(MigrateError::transfer(
            &table.name,
            format!(
                "query returned {} columns but {} are declared",
                row.len(),
                query.width
            ),
        ));
    }
    let columns = row.columns();
    for (declared, &ordinal) in table.source_columns.iter().zip(&query.physical) {
        let name = columns[ordinal].name();
        if !name.eq_ignore_ascii_case(&declared.name) {
            warn!(
                "{}: result column '{}' is read as declared column '{}'",
                table.name, name, declared.name
            );
        }
    }
    Ok(())
}

/// Forward-only column access over a Tiberius row.
struct TiberiusAccess<'r> {
    row: &'r Row,
    query: &'r GuardedSelect,
    next: usize,
}

impl<'r> TiberiusAccess<'r> {
    fn new(row: &'r Row, query: &'r GuardedSelect) -> Self {
        Self { row, query, next: 0 }
    }

    /// Result ordinal of the declared column.
    fn advance(&mut self, ordinal: usize) -> std::result::Result<usize, String> {
        if ordinal < self.next {
            return Err(format!("column {} read out of order", ordinal));
        }
        self.next = ordinal + 1;
        self.query
            .physical
            .get(ordinal)
            .copied()
            .ok_or_else(|| format!("column {} is not declared", ordinal))
    }
}

fn convert(e: tiberius::error::Error) -> String {
    e.to_string()
}

impl ColumnAccess for TiberiusAccess<'_> {
    fn scalar(&mut self, ordinal: usize, ty: SqlType) -> std::result::Result<SqlValue, String> {
        let ordinal = self.advance(ordinal)?;
        let row = self.row;
        let value = match ty {
            SqlType::Bool => row.try_get::<bool, _>(ordinal).map_err(convert)?.map(SqlValue::Bool),
            SqlType::I16 => match row.try_get::<i16, _>(ordinal) {
                Ok(v) => v.map(SqlValue::I16),
                // tinyint arrives as u8
                Err(_) => row
                    .try_get::<u8, _>(ordinal)
                    .map_err(convert)?
                    .map(|v| SqlValue::I16(i16::from(v))),
            },
            SqlType::I32 => row.try_get::<i32, _>(ordinal).map_err(convert)?.map(SqlValue::I32),
            SqlType::I64 => row.try_get::<i64, _>(ordinal).map_err(convert)?.map(SqlValue::I64),
            SqlType::F32 => row.try_get::<f32, _>(ordinal).map_err(convert)?.map(SqlValue::F32),
            SqlType::F64 => row.try_get::<f64, _>(ordinal).map_err(convert)?.map(SqlValue::F64),
            SqlType::Uuid => row.try_get::<Uuid, _>(ordinal).map_err(convert)?.map(SqlValue::Uuid),
            SqlType::Decimal => row
                .try_get::<Decimal, _>(ordinal)
                .map_err(convert)?
                .map(SqlValue::Decimal),
            SqlType::DateTime => row
                .try_get::<NaiveDateTime, _>(ordinal)
                .map_err(convert)?
                .map(SqlValue::DateTime),
            SqlType::DateTimeOffset => row
                .try_get::<DateTime<FixedOffset>, _>(ordinal)
                .map_err(convert)?
                .map(SqlValue::DateTimeOffset),
            SqlType::Date => row.try_get::<NaiveDate, _>(ordinal).map_err(convert)?.map(SqlValue::Date),
            SqlType::Time => row.try_get::<NaiveTime, _>(ordinal).map_err(convert)?.map(SqlValue::Time),
            SqlType::Text | SqlType::Bytes => {
                return Err(format!("{} column {} must be read as a large value", ty, ordinal))
            }
        };
        Ok(value.unwrap_or(SqlValue::Null(ty)))
    }

    fn large(&mut self, ordinal: usize, ty: SqlType) -> std::result::Result<LargeValue<'_>, String> {
        let ordinal = self.advance(ordinal)?;
        let row = self.row;
        let value = match ty {
            SqlType::Text => row
                .try_get::<&str, _>(ordinal)
                .map_err(convert)?
                .map(str::as_bytes),
            SqlType::Bytes => row.try_get::<&[u8], _>(ordinal).map_err(convert)?,
            other => return Err(format!("{} column {} is not a large value", other, ordinal)),
        };
        if let Some(raw) = value {
            return Ok(LargeValue::Present(raw));
        }
        if !self.query.sized {
            return Ok(LargeValue::Null);
        }
        match row.try_get::<i64, _>(ordinal + 1).map_err(convert)? {
            Some(size) => Ok(LargeValue::Withheld {
                size: size.max(0) as u64,
            }),
            None => Ok(LargeValue::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, ty: SqlType) -> SourceColumn {
        SourceColumn {
            name: name.into(),
            ty,
            mandatory: false,
        }
    }

    fn source_config() -> SourceConfig {
        serde_yaml::from_str(
            r#"
host: legacy-db
database: Legacy
user: sa
password: secret
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_build_config_targets_configured_host() {
        let manager = TiberiusConnectionManager::new(source_config());
        assert_eq!(manager.build_config().get_addr(), "legacy-db:1433");
    }

    #[test]
    fn test_select_without_large_columns_is_unchanged() {
        let columns = vec![column("Id", SqlType::I32), column("Name", SqlType::I32)];
        let query = GuardedSelect::new("SELECT Id, Name FROM dbo.T", &columns, 10);
        assert_eq!(query.sql, "SELECT Id, Name FROM dbo.T");
        assert_eq!(query.physical, vec![0, 1]);
        assert_eq!(query.width, 2);
        assert!(!query.sized);
    }

    #[test]
    fn test_large_columns_are_capped_at_the_source() {
        let columns = vec![
            column("Id", SqlType::I32),
            column("Body", SqlType::Text),
            column("Created", SqlType::DateTime),
        ];
        let query = GuardedSelect::new(
            "SELECT t.Id, t.Body, t.Created FROM dbo.Ticket t ORDER BY t.Id DESC;",
            &columns,
            1024,
        );
        assert_eq!(
            query.sql,
            "SELECT [src].[Id], \
             CASE WHEN DATALENGTH([src].[Body]) > 1024 THEN NULL ELSE [src].[Body] END AS [Body], \
             CAST(DATALENGTH([src].[Body]) AS BIGINT) AS [Body__size], [src].[Created] \
             FROM (SELECT t.Id, t.Body, t.Created FROM dbo.Ticket t) AS [src] ORDER BY Id DESC"
        );
        assert_eq!(query.physical, vec![0, 1, 3]);
        assert_eq!(query.width, 4);
        assert!(query.sized);
    }

    #[test]
    fn test_nested_order_by_stays_in_place() {
        let (body, order_by) = split_order_by(
            "SELECT Id FROM (SELECT TOP 5 Id FROM T ORDER BY Id) x WHERE Note = 'order by'",
        );
        assert_eq!(
            body,
            "SELECT Id FROM (SELECT TOP 5 Id FROM T ORDER BY Id) x WHERE Note = 'order by'"
        );
        assert_eq!(order_by, None);

        let (body, order_by) = split_order_by("SELECT [Order By], Id FROM T\nORDER\n  BY [Order By], Id");
        assert_eq!(body, "SELECT [Order By], Id FROM T");
        assert_eq!(order_by, Some("[Order By], Id"));

        assert_eq!(split_order_by("SELECT border_by FROM T").1, None);
    }

    #[test]
    fn test_bracket_escapes_closing_bracket() {
        assert_eq!(bracket("odd]name"), "[odd]]name]");
    }
}
