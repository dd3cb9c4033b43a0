//! # legacy-pg-migrate
//!
//! Bulk record migration from a legacy MSSQL schema into a redesigned
//! PostgreSQL schema.
//!
//! Each table is declared as a [`TableSpec`]: a source SELECT, per-column
//! rules for the target record, reference sets for foreign-key filtering and
//! optional fan-out. The library provides:
//!
//! - **Streaming extraction** on one connection, with capped blob reads
//! - **Parallel transformation** through bounded, backpressured queues
//! - **Binary COPY** bulk writes, single-session or one session per batch
//! - **Ordered upsert** for tables keyed by a logical key
//! - **Transactional runs** that roll back every table on failure
//!
//! ## Example
//!
//! ```rust,no_run
//! use legacy_pg_migrate::{Config, Coordinator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> legacy_pg_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let coordinator = Coordinator::connect(config).await?;
//!     let result = coordinator.run_all(true, &CancellationToken::new()).await?;
//!     println!("Inserted {} rows", result.total_inserted);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod mapping;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod reference;
pub mod security;
pub mod source;
pub mod target;
pub mod transfer;
pub mod transform;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SecurityConfig, SourceConfig, TargetConfig};
pub use crate::core::{Batch, SourceRow, SqlType, SqlValue, TargetRecord};
pub use error::{MigrateError, Result, RowError};
pub use mapping::{MigrationLogics, TableSpec};
pub use orchestrator::{Coordinator, HealthCheckResult, RunResult};
pub use progress::{ProgressEvent, ProgressObserver, TableResult, TableStatus};
pub use source::{MemorySource, MssqlSource, SourceReader};
pub use target::{MemoryTarget, PostgresTarget, SslMode, TargetStore};
pub use transfer::{TransferConfig, TransferEngine, TransferStats};
