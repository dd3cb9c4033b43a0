//! Configuration validation.

use std::collections::{BTreeMap, HashSet};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::Config;
use crate::error::{MigrateError, Result};
use crate::mapping::{MigrationLogics, TableSpec};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }
    if config.source.r#type != "mssql" {
        return Err(MigrateError::Config(format!(
            "source.type must be 'mssql', got '{}'",
            config.source.r#type
        )));
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    if config.target.r#type != "postgres" {
        return Err(MigrateError::Config(format!(
            "target.type must be 'postgres', got '{}'",
            config.target.r#type
        )));
    }

    // Migration settings - only checked when explicitly set
    let migration = &config.migration;
    for (name, value) in [
        ("workers", migration.workers),
        ("batch_size", migration.batch_size),
        ("raw_queue_capacity", migration.raw_queue_capacity),
        ("batch_queue_capacity", migration.batch_queue_capacity),
        ("writers", migration.writers),
        ("upsert_batch_size", migration.upsert_batch_size),
        ("max_mssql_connections", migration.max_mssql_connections),
        ("max_pg_connections", migration.max_pg_connections),
    ] {
        if value == Some(0) {
            return Err(MigrateError::Config(format!(
                "migration.{} must be at least 1",
                name
            )));
        }
    }
    if migration.get_max_pg_connections() < migration.get_writers() {
        return Err(MigrateError::Config(format!(
            "migration.max_pg_connections ({}) must be at least migration.writers ({})",
            migration.get_max_pg_connections(),
            migration.get_writers()
        )));
    }

    // Security
    if config.security.hash_iterations == 0 {
        return Err(MigrateError::Config(
            "security.hash_iterations must be at least 1".into(),
        ));
    }
    if let Some(key) = &config.security.encryption_key {
        match BASE64.decode(key) {
            Ok(bytes) if bytes.len() == 32 => {}
            _ => {
                return Err(MigrateError::Config(
                    "security.encryption_key must be 32 bytes, base64 encoded".into(),
                ))
            }
        }
    }

    validate_tables(config)
}

/// Compile every table, check its metadata and the dependency graph.
fn validate_tables(config: &Config) -> Result<()> {
    let mut names = HashSet::new();
    for spec in &config.tables {
        if !names.insert(spec.name.as_str()) {
            return Err(MigrateError::Config(format!(
                "table '{}' is declared more than once",
                spec.name
            )));
        }

        let compiled = spec.compile(&config.target.schema)?;

        let target_columns: Vec<&str> = spec.columns.iter().map(|c| c.name.as_str()).collect();
        if !MigrationLogics::for_table(spec).matches(&target_columns) {
            return Err(MigrateError::Config(format!(
                "table '{}': mapping metadata does not cover every target column",
                spec.name
            )));
        }

        if compiled.needs_cipher() && config.security.encryption_key.is_none() {
            return Err(MigrateError::Config(format!(
                "table '{}' has encrypt rules but security.encryption_key is not set",
                spec.name
            )));
        }
    }

    execution_order(&config.tables).map(|_| ())
}

/// Topological order over `depends_on`, stable with respect to declaration order.
pub fn execution_order(tables: &[TableSpec]) -> Result<Vec<String>> {
    let declared: HashSet<&str> = tables.iter().map(|t| t.name.as_str()).collect();
    let mut pending: BTreeMap<usize, (&str, Vec<&str>)> = BTreeMap::new();

    for (i, spec) in tables.iter().enumerate() {
        for dep in &spec.depends_on {
            if !declared.contains(dep.as_str()) {
                return Err(MigrateError::Config(format!(
                    "table '{}' depends on unknown table '{}'",
                    spec.name, dep
                )));
            }
        }
        let deps = spec.depends_on.iter().map(String::as_str).collect();
        pending.insert(i, (spec.name.as_str(), deps));
    }

    let mut done: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(tables.len());
    while !pending.is_empty() {
        let ready = pending
            .iter()
            .find(|(_, (_, deps))| deps.iter().all(|d| done.contains(d)))
            .map(|(&i, &(name, _))| (i, name));

        match ready {
            Some((i, name)) => {
                pending.remove(&i);
                done.insert(name);
                order.push(name.to_string());
            }
            None => {
                let stuck: Vec<&str> = pending.values().map(|(name, _)| *name).collect();
                return Err(MigrateError::Config(format!(
                    "dependency cycle between tables: {}",
                    stuck.join(", ")
                )));
            }
        }
    }

    Ok(order)
}
