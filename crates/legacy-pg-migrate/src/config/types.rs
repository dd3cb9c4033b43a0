//! Configuration type definitions with auto-tuning based on system resources.

use std::fmt;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::mapping::TableSpec;
use crate::reference::ReferenceLoadPolicy;
use crate::source::BlobPolicy;
use crate::target::SslMode;
use crate::transfer::TransferConfig;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len().max(1),
        }
    }

    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Legacy database (MSSQL).
    pub source: SourceConfig,

    /// Redesigned database (PostgreSQL).
    pub target: TargetConfig,

    #[serde(default)]
    pub migration: MigrationConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    /// Table mappings, addressable by name.
    #[serde(default)]
    pub tables: Vec<TableSpec>,
}

impl Config {
    /// Fill unset performance settings from the host's resources.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }
}

/// Source database (MSSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_mssql")]
    pub r#type: String,

    pub host: String,

    #[serde(default = "default_mssql_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Require TLS on the TDS connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Accept any server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &REDACTED)
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_postgres")]
    pub r#type: String,

    pub host: String,

    #[serde(default = "default_pg_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Schema for tables that do not name one (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    #[serde(default)]
    pub ssl_mode: SslMode,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &REDACTED)
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Migration behavior configuration.
///
/// Performance fields are `Option<T>` to tell "not set" (auto-tuned) apart
/// from "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationConfig {
    /// Transform workers. Auto-tuned to cores - 1 if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Target records per batch. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Raw row queue capacity. Defaults to workers * 256.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_queue_capacity: Option<usize>,

    /// Batch queue capacity, in batches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_queue_capacity: Option<usize>,

    /// Bulk writers. More than one commits per batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writers: Option<usize>,

    /// Source rows per upsert window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upsert_batch_size: Option<usize>,

    /// Largest blob kept; bigger values are NULLed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_blob_bytes: Option<usize>,

    /// Rows between progress reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_interval: Option<u64>,

    /// Row errors logged individually per table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log_limit: Option<usize>,

    #[serde(default)]
    pub reference_load_policy: ReferenceLoadPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_mssql_connections: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pg_connections: Option<usize>,
}

impl MigrationConfig {
    /// Fill values that are `None` from detected resources.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;
        let cores = resources.cpu_cores;

        // cores - 1: extraction has its own task
        let workers = *self
            .workers
            .get_or_insert_with(|| cores.saturating_sub(1).clamp(1, 32));

        // 1K records per batch, +1K per 8GB of RAM, capped at 10K
        self.batch_size
            .get_or_insert_with(|| (1_000 + (ram_gb / 8.0) as usize * 1_000).clamp(1_000, 10_000));

        self.raw_queue_capacity.get_or_insert(workers * 256);
        self.batch_queue_capacity
            .get_or_insert_with(|| ((ram_gb / 4.0) as usize).clamp(2, 16));

        self.upsert_batch_size
            .get_or_insert_with(|| ((ram_gb / 8.0) as usize * 500).clamp(500, 5_000));

        // Source pool: one extraction stream plus health checks
        self.max_mssql_connections.get_or_insert(2);
        let writers = self.get_writers();
        self.max_pg_connections
            .get_or_insert_with(|| (writers * 2 + 2).clamp(4, 64));

        info!(
            "Auto-tuned config: workers={}, writers={}, batch_size={}, raw_queue={}, batch_queue={}, \
             upsert_batch={}, mssql_conns={}, pg_conns={}",
            self.get_workers(),
            self.get_writers(),
            self.get_batch_size(),
            self.get_raw_queue_capacity(),
            self.get_batch_queue_capacity(),
            self.get_upsert_batch_size(),
            self.get_max_mssql_connections(),
            self.get_max_pg_connections(),
        );

        self
    }

    // Effective values, with fallbacks for configs that were not auto-tuned.

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(1_000)
    }

    pub fn get_raw_queue_capacity(&self) -> usize {
        self.raw_queue_capacity
            .unwrap_or_else(|| self.get_workers() * 256)
    }

    pub fn get_batch_queue_capacity(&self) -> usize {
        self.batch_queue_capacity.unwrap_or(4)
    }

    pub fn get_writers(&self) -> usize {
        self.writers.unwrap_or(1)
    }

    pub fn get_upsert_batch_size(&self) -> usize {
        self.upsert_batch_size.unwrap_or(500)
    }

    pub fn get_blob_policy(&self) -> BlobPolicy {
        BlobPolicy {
            max_bytes: self
                .max_blob_bytes
                .unwrap_or(BlobPolicy::default().max_bytes),
        }
    }

    pub fn get_progress_interval(&self) -> u64 {
        self.progress_interval.unwrap_or(10_000)
    }

    pub fn get_error_log_limit(&self) -> usize {
        self.error_log_limit.unwrap_or(20)
    }

    pub fn get_max_mssql_connections(&self) -> usize {
        self.max_mssql_connections.unwrap_or(2)
    }

    pub fn get_max_pg_connections(&self) -> usize {
        self.max_pg_connections.unwrap_or(8)
    }

    /// Settings for the transfer engine.
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            workers: self.get_workers(),
            writers: self.get_writers(),
            batch_size: self.get_batch_size(),
            raw_queue_capacity: self.get_raw_queue_capacity(),
            batch_queue_capacity: self.get_batch_queue_capacity(),
            upsert_batch_size: self.get_upsert_batch_size(),
            blob: self.get_blob_policy(),
        }
    }
}

/// Password hashing and field encryption settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// PBKDF2 iterations in secure mode.
    #[serde(default = "default_hash_iterations")]
    pub hash_iterations: u32,

    /// Use salted SHA-256 instead of PBKDF2.
    #[serde(default)]
    pub fast_mode: bool,

    /// Base64 AES-256 key for `encrypt` rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            hash_iterations: default_hash_iterations(),
            fast_mode: false,
            encryption_key: None,
        }
    }
}

impl fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("hash_iterations", &self.hash_iterations)
            .field("fast_mode", &self.fast_mode)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| REDACTED),
            )
            .finish()
    }
}

const REDACTED: &str = "[REDACTED]";

fn default_mssql() -> String {
    "mssql".to_string()
}

fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_true() -> bool {
    true
}

fn default_hash_iterations() -> u32 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tuning_keeps_explicit_values() {
        let resources = SystemResources {
            total_memory_gb: 32.0,
            cpu_cores: 8,
        };
        let tuned = MigrationConfig {
            workers: Some(3),
            ..Default::default()
        }
        .with_auto_tuning(&resources);

        assert_eq!(tuned.workers, Some(3));
        assert_eq!(tuned.raw_queue_capacity, Some(768));
        assert_eq!(tuned.batch_size, Some(5_000));
    }

    #[test]
    fn test_auto_tuning_workers_follow_cores() {
        let small = SystemResources {
            total_memory_gb: 2.0,
            cpu_cores: 1,
        };
        let big = SystemResources {
            total_memory_gb: 2.0,
            cpu_cores: 16,
        };
        assert_eq!(MigrationConfig::default().with_auto_tuning(&small).workers, Some(1));
        assert_eq!(MigrationConfig::default().with_auto_tuning(&big).workers, Some(15));
    }

    #[test]
    fn test_transfer_config_uses_fallbacks() {
        let config = MigrationConfig::default().transfer_config();
        assert_eq!(config.workers, 4);
        assert_eq!(config.writers, 1);
        assert_eq!(config.raw_queue_capacity, 1024);
        assert_eq!(config.blob, BlobPolicy::default());
    }

    #[test]
    fn test_security_debug_redacts_key() {
        let security = SecurityConfig {
            encryption_key: Some("c2VjcmV0LWtleQ==".into()),
            ..Default::default()
        };
        let debug = format!("{:?}", security);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("c2VjcmV0LWtleQ=="));
    }
}
