//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{MigrateError, Result};
use crate::mapping::CompiledTable;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file without validating it, so overrides can be applied first.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate connections, settings and every table mapping.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Table names in an order that satisfies every `depends_on`.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        validation::execution_order(&self.tables)
    }

    /// Compile the named table against the target's default schema.
    pub fn compile_table(&self, name: &str) -> Result<CompiledTable> {
        self.table(name)
            .ok_or_else(|| MigrateError::UnknownTable(name.to_string()))?
            .compile(&self.target.schema)
    }

    /// SHA256 of the configuration, recorded in run summaries.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
source: { host: legacy-db, database: legacy, user: sa }
target: { host: localhost, database: app, user: app, ssl_mode: verify-full }
tables:
  - name: event
    select: SELECT EventId FROM dbo.Events
    source_columns: [{ name: EventId, type: int }]
    columns: [{ name: id, type: bigint, rule: { kind: direct, source: EventId } }]
"#;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", MINIMAL).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.source.port, 1433);
        assert!(config.source.encrypt);
        assert_eq!(config.target.schema, "public");
        assert_eq!(config.target.ssl_mode, crate::target::SslMode::VerifyFull);
        assert_eq!(config.security.hash_iterations, 10_000);
        assert_eq!(config.table_names(), vec!["event"]);
    }

    #[test]
    fn test_read_skips_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", MINIMAL.replace("user: sa", "user: \"\"")).unwrap();

        assert!(Config::read(file.path()).is_ok());
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_compile_unknown_table() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert!(config.compile_table("event").is_ok());
        assert!(matches!(
            config.compile_table("orders"),
            Err(MigrateError::UnknownTable(_))
        ));
    }

    #[test]
    fn test_hash_is_stable() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.hash(), config.hash());
        assert_eq!(config.hash().len(), 64);
    }
}
