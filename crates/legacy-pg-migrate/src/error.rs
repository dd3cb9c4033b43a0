//! Error types for the migration library.
//!
//! Two layers: [`MigrateError`] is fatal to a table run (or the whole run), while
//! [`RowError`] describes a single row that could not be converted and is counted
//! as errored without stopping the stream.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, inconsistent mapping, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Data transfer failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// A reference key set could not be loaded and the policy is to abort
    #[error("Reference set '{name}' could not be loaded: {message}")]
    Reference { name: String, message: String },

    /// Upsert-by-sequence input arrived out of order
    #[error("Sequence order violated for table {table}: {message}")]
    Ordering { table: String, message: String },

    /// No table with this name is configured
    #[error("Unknown table '{0}'")]
    UnknownTable(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, or another stage failed first)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// True for errors that only exist because another stage already failed or
    /// the caller aborted. They never replace a primary failure.
    pub fn is_secondary(&self) -> bool {
        matches!(self, MigrateError::Cancelled)
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_)
            | MigrateError::Yaml(_)
            | MigrateError::Json(_)
            | MigrateError::UnknownTable(_) => 1,
            MigrateError::Source(_) => 2,
            MigrateError::Target(_) | MigrateError::Pool { .. } => 3,
            MigrateError::Transfer { .. }
            | MigrateError::Reference { .. }
            | MigrateError::Ordering { .. } => 4,
            MigrateError::Cancelled => 5,
            MigrateError::Io(_) => 7,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// A failure confined to one source row.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RowError {
    /// Row had fewer values than declared columns
    #[error("column {0} is missing from the row")]
    MissingColumn(usize),

    /// Value could not be converted to the declared type
    #[error("column '{column}': {message}")]
    Conversion { column: String, message: String },

    /// Fan-out base id was null or not an integer
    #[error("fan-out base column '{0}' has no integer value")]
    FanOutBase(String),

    /// Deterministic id arithmetic overflowed
    #[error("fan-out id overflow for base {base}")]
    Overflow { base: i64 },

    /// Hashing or encryption failed
    #[error("crypto failure in '{column}': {message}")]
    Crypto { column: String, message: String },
}

impl RowError {
    pub fn conversion(column: impl Into<String>, message: impl Into<String>) -> Self {
        RowError::Conversion {
            column: column.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
