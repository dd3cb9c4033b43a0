//! Descriptive mapping metadata: one entry per target column.

use serde::Serialize;

use super::table::TableSpec;

/// One (source label, description, target column) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationLogic {
    pub source: String,
    pub description: String,
    pub target: String,
}

/// Ordered column descriptors for a table, parallel to its target columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationLogics {
    pub table: String,
    pub target_table: String,
    pub columns: Vec<MigrationLogic>,
}

impl MigrationLogics {
    pub fn for_table(spec: &TableSpec) -> Self {
        let columns = spec
            .columns
            .iter()
            .map(|col| {
                let sources = col.rule.sources();
                let source = if sources.is_empty() {
                    "-".to_string()
                } else {
                    sources.join(", ")
                };
                MigrationLogic {
                    source,
                    description: col
                        .description
                        .clone()
                        .unwrap_or_else(|| col.rule.describe()),
                    target: col.name.clone(),
                }
            })
            .collect();

        Self {
            table: spec.name.clone(),
            target_table: spec.target_table_name().to_string(),
            columns,
        }
    }

    /// True when there is exactly one descriptor per target column, in order.
    pub fn matches(&self, target_columns: &[&str]) -> bool {
        self.columns.len() == target_columns.len()
            && self
                .columns
                .iter()
                .zip(target_columns)
                .all(|(logic, name)| logic.target == *name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logics_follow_target_columns() {
        let spec: TableSpec = serde_yaml::from_str(
            r#"
name: users
select: SELECT UserId, First, Last, Pwd FROM dbo.Users
source_columns:
  - { name: UserId, type: int }
  - { name: First, type: text }
  - { name: Last, type: text }
  - { name: Pwd, type: text }
columns:
  - { name: id, type: bigint, rule: { kind: direct, source: UserId } }
  - { name: full_name, type: text, rule: { kind: concat, sources: [First, Last], separator: " " } }
  - { name: password_hash, type: text, rule: { kind: password_hash, source: Pwd, output: hash } }
  - { name: created_by, type: text, rule: { kind: fixed }, description: "Always empty" }
"#,
        )
        .unwrap();

        let logics = MigrationLogics::for_table(&spec);
        assert!(logics.matches(&["id", "full_name", "password_hash", "created_by"]));
        assert!(!logics.matches(&["id", "full_name"]));
        assert_eq!(logics.columns[1].source, "First, Last");
        assert_eq!(logics.columns[2].description, "Password hash");
        assert_eq!(logics.columns[3].source, "-");
        assert_eq!(logics.columns[3].description, "Always empty");
    }
}
