//! Target side: reference key loads, bulk sessions, upserts and transactions.
//!
//! Everything the pipeline does against the target goes through
//! [`TargetStore`]. A transactional run obtains a store bound to a single
//! connection from [`TargetStore::begin`] and hands that store to every stage.

mod copy;
mod memory;
mod postgres;
mod tls;

pub use copy::CopyEncoder;
pub use memory::MemoryTarget;
pub use postgres::PostgresTarget;
pub use tls::{SslMode, TlsBuilder};

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{Batch, TargetRecord};
use crate::error::Result;
use crate::mapping::TargetTable;
use crate::reference::ReferenceKey;

/// Operations the pipeline needs from the target store.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Run a key query and return one key per row.
    ///
    /// Multi-column rows become composite keys. Rows with a NULL part are dropped.
    /// A failed load inside a transaction leaves the transaction usable.
    async fn load_keys(&self, query: &str) -> Result<Vec<ReferenceKey>>;

    /// Open a bulk-load session for one table.
    async fn open_bulk(&self, table: &TargetTable) -> Result<Box<dyn BulkSession>>;

    /// Insert-or-update each record by `key_columns`, in the given order.
    ///
    /// Applied atomically: either every record lands or none does.
    async fn upsert(
        &self,
        table: &TargetTable,
        key_columns: &[String],
        records: &[TargetRecord],
    ) -> Result<u64>;

    /// Start a transaction. The returned store runs on the transaction's connection.
    async fn begin(&self) -> Result<Box<dyn TargetTransaction>>;

    /// Check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Upper bound on concurrent bulk sessions, if the store imposes one.
    fn max_writers(&self) -> Option<usize> {
        None
    }

    /// Get the database type.
    fn db_type(&self) -> &str;
}

/// An open bulk load into one table.
///
/// Nothing written to a session is visible until [`finish`](BulkSession::finish)
/// succeeds. Dropping or aborting a session discards everything written to it.
#[async_trait]
pub trait BulkSession: Send {
    /// Stream a batch into the session.
    async fn write(&mut self, batch: &Batch) -> Result<()>;

    /// Commit the session and return the number of records it loaded.
    async fn finish(self: Box<Self>) -> Result<u64>;

    /// Discard the session.
    async fn abort(self: Box<Self>);
}

/// A target transaction.
#[async_trait]
pub trait TargetTransaction: Send + Sync {
    /// Store whose operations run inside this transaction.
    fn store(&self) -> Arc<dyn TargetStore>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
