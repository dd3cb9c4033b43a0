//! PostgreSQL target over deadpool-postgres.
//!
//! Bulk sessions are binary COPY streams. A transaction pins one pooled
//! connection; the store handed out by [`TargetStore::begin`] runs every
//! operation on it.

use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::SinkExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{
    Client, Config as PgConfig, CopyInSink, GenericClient, NoTls, Row, Statement, Transaction,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::copy::{pg_type, CopyEncoder};
use super::{BulkSession, TargetStore, TargetTransaction, TlsBuilder};
use crate::config::TargetConfig;
use crate::core::{Batch, SqlType, SqlValue, TargetRecord};
use crate::error::{MigrateError, Result};
use crate::mapping::{quote_ident, TargetTable};
use crate::reference::ReferenceKey;

/// Connect timeout for new target connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP keepalive idle time.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Savepoint guarding key queries inside a pinned transaction.
const REFERENCE_SAVEPOINT: &str = "reference_load";

/// PostgreSQL target store.
pub struct PostgresTarget {
    pool: Pool,
    pinned: Option<Arc<Mutex<Object>>>,
}

/// A connection borrowed from the pool, or the transaction's pinned one.
enum ClientHandle {
    Pooled(Object),
    Pinned(OwnedMutexGuard<Object>),
}

impl Deref for ClientHandle {
    type Target = Object;

    fn deref(&self) -> &Object {
        match self {
            ClientHandle::Pooled(obj) => obj,
            ClientHandle::Pinned(guard) => guard,
        }
    }
}

impl DerefMut for ClientHandle {
    fn deref_mut(&mut self) -> &mut Object {
        match self {
            ClientHandle::Pooled(obj) => obj,
            ClientHandle::Pinned(guard) => guard,
        }
    }
}

impl PostgresTarget {
    /// Build the pool and verify with a test query.
    pub async fn connect(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.user)
            .password(&config.password)
            .application_name("legacy-pg-migrate")
            .keepalives(true)
            .keepalives_idle(KEEPALIVE_IDLE)
            .connect_timeout(CONNECT_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = match TlsBuilder::new(config.ssl_mode).build()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, NoTls, mgr_config)
            }
        };
        let pool = Pool::builder(manager)
            .max_size(max_conns.max(1))
            .build()
            .map_err(|e| MigrateError::pool(e.to_string(), "creating PostgreSQL pool"))?;

        let target = Self { pool, pinned: None };
        target.ping().await?;

        info!(
            "Connected to PostgreSQL: {}:{}/{} (ssl_mode={}, pool_size={})",
            config.host, config.port, config.database, config.ssl_mode, max_conns
        );
        Ok(target)
    }

    async fn client(&self) -> Result<ClientHandle> {
        match &self.pinned {
            Some(conn) => Ok(ClientHandle::Pinned(conn.clone().lock_owned().await)),
            None => self
                .pool
                .get()
                .await
                .map(ClientHandle::Pooled)
                .map_err(|e| MigrateError::pool(e.to_string(), "getting PostgreSQL connection")),
        }
    }
}

#[async_trait]
impl TargetStore for PostgresTarget {
    async fn load_keys(&self, query: &str) -> Result<Vec<ReferenceKey>> {
        let client = self.client().await?;
        if self.pinned.is_none() {
            return query_keys(&client, query).await;
        }

        // A failed statement aborts the whole transaction unless it ran
        // under a savepoint.
        client
            .batch_execute(&format!("SAVEPOINT {}", REFERENCE_SAVEPOINT))
            .await?;
        match query_keys(&client, query).await {
            Ok(keys) => {
                client
                    .batch_execute(&format!("RELEASE SAVEPOINT {}", REFERENCE_SAVEPOINT))
                    .await?;
                Ok(keys)
            }
            Err(e) => {
                client
                    .batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", REFERENCE_SAVEPOINT))
                    .await?;
                Err(e)
            }
        }
    }

    async fn open_bulk(&self, table: &TargetTable) -> Result<Box<dyn BulkSession>> {
        let client = self.client().await?;
        let sql = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT BINARY)",
            table.qualified_name(),
            table.column_list()
        );
        let sink: CopyInSink<Bytes> = client
            .copy_in(sql.as_str())
            .await
            .map_err(|e| MigrateError::transfer(&table.name, format!("COPY start: {}", e)))?;

        Ok(Box::new(PgBulkSession {
            _client: client,
            sink: Box::pin(sink),
            encoder: CopyEncoder::new(&table.columns),
            table: table.name.clone(),
        }))
    }

    async fn upsert(
        &self,
        table: &TargetTable,
        key_columns: &[String],
        records: &[TargetRecord],
    ) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let sql = upsert_sql(table, key_columns);
        let types: Vec<Type> = table.columns.iter().map(|c| pg_type(c.ty)).collect();
        let mut client = self.client().await?;

        // Inside a pinned transaction the caller owns atomicity.
        let n = if self.pinned.is_some() {
            let stmt = client.prepare_typed(&sql, &types).await?;
            apply_upsert::<Client>(&client, &stmt, records).await?
        } else {
            let tx = client.transaction().await?;
            let stmt = tx.prepare_typed(&sql, &types).await?;
            // Dropping `tx` on error rolls it back.
            let n = apply_upsert::<Transaction<'_>>(&tx, &stmt, records).await?;
            tx.commit().await?;
            n
        };
        debug!("{}: upserted {} records", table.name, n);
        Ok(n)
    }

    async fn begin(&self) -> Result<Box<dyn TargetTransaction>> {
        if self.pinned.is_some() {
            return Err(MigrateError::Config(
                "nested target transactions are not supported".into(),
            ));
        }
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "starting PostgreSQL transaction"))?;
        conn.batch_execute("BEGIN").await?;

        let conn = Arc::new(Mutex::new(conn));
        let store = Arc::new(PostgresTarget {
            pool: self.pool.clone(),
            pinned: Some(conn.clone()),
        });
        Ok(Box::new(PgTransaction {
            conn,
            store,
            finished: false,
        }))
    }

    async fn ping(&self) -> Result<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn max_writers(&self) -> Option<usize> {
        self.pinned.as_ref().map(|_| 1)
    }

    fn db_type(&self) -> &str {
        "postgres"
    }
}

async fn query_keys(client: &Client, query: &str) -> Result<Vec<ReferenceKey>> {
    let rows = client.query(query, &[]).await?;

    let mut keys = Vec::with_capacity(rows.len());
    for row in &rows {
        let values = (0..row.len())
            .map(|i| key_part(row, i))
            .collect::<Result<Vec<_>>>()?;
        if let Some(key) = ReferenceKey::from_values(&values) {
            keys.push(key);
        }
    }
    Ok(keys)
}

async fn apply_upsert<C: GenericClient + Sync>(
    client: &C,
    stmt: &Statement,
    records: &[TargetRecord],
) -> Result<u64> {
    let mut n = 0u64;
    for record in records {
        let params: Vec<&(dyn ToSql + Sync)> = record
            .values()
            .iter()
            .map(|v| v as &(dyn ToSql + Sync))
            .collect();
        n += client.execute(stmt, &params).await?;
    }
    Ok(n)
}

/// One key column of a reference query row.
fn key_part(row: &Row, idx: usize) -> Result<SqlValue> {
    let ty = row.columns()[idx].type_();
    let value = if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(SqlValue::I16)
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.map(SqlValue::I32)
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::I64)
    } else if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool)
    } else if *ty == Type::UUID {
        row.try_get::<_, Option<Uuid>>(idx)?.map(SqlValue::Uuid)
    } else if *ty == Type::NUMERIC {
        row.try_get::<_, Option<rust_decimal::Decimal>>(idx)?
            .map(SqlValue::Decimal)
    } else if [Type::TEXT, Type::VARCHAR, Type::BPCHAR, Type::NAME].contains(ty) {
        row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
    } else {
        return Err(MigrateError::Config(format!(
            "reference key column '{}' has unsupported type {}",
            row.columns()[idx].name(),
            ty
        )));
    };
    Ok(value.unwrap_or(SqlValue::Null(SqlType::Text)))
}

/// `INSERT ... ON CONFLICT` for one record, updating every non-key column.
fn upsert_sql(table: &TargetTable, key_columns: &[String]) -> String {
    let placeholders = (1..=table.columns.len())
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let keys = key_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let updates: Vec<String> = table
        .columns
        .iter()
        .filter(|c| !key_columns.contains(&c.name))
        .map(|c| {
            let col = quote_ident(&c.name);
            format!("{} = EXCLUDED.{}", col, col)
        })
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        table.qualified_name(),
        table.column_list(),
        placeholders,
        keys,
        action
    )
}

struct PgBulkSession {
    // Held so the connection stays checked out for the life of the COPY.
    _client: ClientHandle,
    sink: Pin<Box<CopyInSink<Bytes>>>,
    encoder: CopyEncoder,
    table: String,
}

#[async_trait]
impl BulkSession for PgBulkSession {
    async fn write(&mut self, batch: &Batch) -> Result<()> {
        self.encoder
            .encode_batch(batch)
            .map_err(|e| MigrateError::transfer(&self.table, e))?;
        let chunk = self.encoder.take();
        self.sink
            .send(chunk)
            .await
            .map_err(|e| MigrateError::transfer(&self.table, format!("COPY send: {}", e)))
    }

    async fn finish(self: Box<Self>) -> Result<u64> {
        let PgBulkSession {
            _client,
            mut sink,
            encoder,
            table,
        } = *self;
        sink.send(encoder.finish())
            .await
            .map_err(|e| MigrateError::transfer(&table, format!("COPY send: {}", e)))?;
        sink.as_mut()
            .finish()
            .await
            .map_err(|e| MigrateError::transfer(&table, format!("COPY finish: {}", e)))
    }

    async fn abort(self: Box<Self>) {
        // Dropping an unfinished sink sends CopyFail.
        debug!("{}: aborting COPY session", self.table);
    }
}

struct PgTransaction {
    conn: Arc<Mutex<Object>>,
    store: Arc<PostgresTarget>,
    finished: bool,
}

#[async_trait]
impl TargetTransaction for PgTransaction {
    fn store(&self) -> Arc<dyn TargetStore> {
        self.store.clone()
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.conn.lock().await.batch_execute("COMMIT").await?;
        info!("Target transaction committed");
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.conn.lock().await.batch_execute("ROLLBACK").await?;
        warn!("Target transaction rolled back");
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let conn = self.conn.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = conn.lock().await.batch_execute("ROLLBACK").await {
                    warn!("Rollback of abandoned transaction failed: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::TargetColumn;

    fn table(columns: &[&str]) -> TargetTable {
        TargetTable {
            schema: "public".into(),
            name: "event_member".into(),
            columns: columns
                .iter()
                .map(|c| TargetColumn {
                    name: c.to_string(),
                    ty: SqlType::I64,
                })
                .collect(),
        }
    }

    #[test]
    fn test_upsert_sql_updates_non_key_columns() {
        let sql = upsert_sql(&table(&["id", "event_id", "score"]), &["id".to_string()]);
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"event_member\" (\"id\", \"event_id\", \"score\") \
             VALUES ($1, $2, $3) ON CONFLICT (\"id\") \
             DO UPDATE SET \"event_id\" = EXCLUDED.\"event_id\", \"score\" = EXCLUDED.\"score\""
        );
    }

    fn local_config() -> TargetConfig {
        TargetConfig {
            r#type: "postgres".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "PostgresPassword123".to_string(),
            schema: "public".to_string(),
            ssl_mode: crate::target::SslMode::Disable,
        }
    }

    /// Needs a local PostgreSQL server.
    #[tokio::test]
    #[ignore] // Run with --ignored flag
    async fn test_failed_key_load_keeps_transaction_usable() {
        let target = PostgresTarget::connect(&local_config(), 2)
            .await
            .expect("Failed to connect");
        let tx = target.begin().await.unwrap();
        let store = tx.store();

        assert!(store
            .load_keys("SELECT id FROM table_that_does_not_exist")
            .await
            .is_err());
        let keys = store
            .load_keys("SELECT * FROM (VALUES (1::int8), (2::int8)) AS k(id)")
            .await
            .unwrap();
        assert_eq!(keys, vec![ReferenceKey::Int(1), ReferenceKey::Int(2)]);
        tx.rollback().await.unwrap();
    }

    /// Needs a local PostgreSQL server.
    #[tokio::test]
    #[ignore] // Run with --ignored flag
    async fn test_failed_upsert_returns_clean_client_to_pool() {
        let target = PostgresTarget::connect(&local_config(), 1)
            .await
            .expect("Failed to connect");
        let mut missing = table(&["id", "score"]);
        missing.name = "table_that_does_not_exist".into();
        let records = vec![TargetRecord::new(vec![SqlValue::I64(1), SqlValue::I64(2)])];

        assert!(target
            .upsert(&missing, &["id".to_string()], &records)
            .await
            .is_err());
        // Single-connection pool: this reuses the client the upsert failed on.
        let keys = target.load_keys("SELECT 7::int8").await.unwrap();
        assert_eq!(keys, vec![ReferenceKey::Int(7)]);
    }

    #[test]
    fn test_upsert_sql_all_key_columns_does_nothing() {
        let keys = vec!["event_id".to_string(), "member_id".to_string()];
        let sql = upsert_sql(&table(&["event_id", "member_id"]), &keys);
        assert!(sql.ends_with("ON CONFLICT (\"event_id\", \"member_id\") DO NOTHING"));
    }
}
