//! Per-table migration declaration and its compiled, ordinal-resolved form.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::rules::{ColumnRule, HashPart};
use crate::core::{SqlType, SqlValue};
use crate::error::{MigrateError, Result};

/// Everything needed to migrate one table, as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    /// Name used to trigger the migration (`run <name>`).
    pub name: String,

    /// Source SELECT. Its select list must match `source_columns` in order.
    pub select: String,

    /// Declared source columns, in select-list order.
    pub source_columns: Vec<SourceColumn>,

    /// Target table name (defaults to `name`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,

    /// Target schema (defaults to `target.schema`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_schema: Option<String>,

    /// Target columns in table order, each with its rule.
    pub columns: Vec<ColumnSpec>,

    /// Reference key sets loaded from the target before the run.
    #[serde(default)]
    pub references: Vec<ReferenceSpec>,

    /// Expand each source row once per member of a reference set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_out: Option<FanOutSpec>,

    #[serde(default)]
    pub write: WriteMode,

    /// Tables that must be migrated before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A source column in select-list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: SqlType,
    /// An oversized value in a mandatory column rejects the row instead of
    /// nulling the field.
    #[serde(default)]
    pub mandatory: bool,
}

/// A target column with the rule that fills it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: SqlType,
    pub rule: ColumnRule,
    /// Overrides the generated description in mapping metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSpec {
    pub name: String,
    /// Target-side query returning one key column, or several for a composite key.
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutSpec {
    /// Reference set to expand over, in ascending key order.
    pub reference: String,
    /// Source column holding the integer base of the generated ids.
    pub id_source: String,
    #[serde(default = "default_multiplier")]
    pub multiplier: i64,
}

/// How records reach the target table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WriteMode {
    /// Parallel pipeline with binary COPY.
    #[default]
    Bulk,
    /// Single-threaded, ordered insert-or-update keyed by `key_columns`.
    Upsert {
        key_columns: Vec<String>,
        /// Source column that must never decrease along the stream.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_column: Option<String>,
    },
}

fn default_multiplier() -> i64 {
    1000
}

/// Resolved target table shape.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetTable {
    pub schema: String,
    pub name: String,
    pub columns: Vec<TargetColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetColumn {
    pub name: String,
    pub ty: SqlType,
}

impl TargetTable {
    /// Schema-qualified, quoted table name.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    /// Quoted column list in table order.
    pub fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A rule with every source name resolved to its ordinal.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOp {
    Direct(usize),
    Fixed(SqlValue),
    ForeignKey { ordinals: Vec<usize>, reference: String },
    PasswordHash { ordinal: usize, part: HashPart },
    Encrypt(usize),
    Mask { ordinal: usize, visible: usize, mask_char: char },
    Concat { ordinals: Vec<usize>, separator: String },
    Choose { when: usize, then: usize, otherwise: usize },
    Coalesce(Vec<usize>),
    FanOutId,
    FanOutMember,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub column: String,
    pub ty: SqlType,
    pub op: RuleOp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFanOut {
    pub reference: String,
    pub base_ordinal: usize,
    pub multiplier: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompiledWrite {
    Bulk,
    Upsert {
        key_columns: Vec<String>,
        key_indexes: Vec<usize>,
        sequence_ordinal: Option<usize>,
    },
}

/// A table spec checked for consistency and resolved once, before any row is read.
#[derive(Debug, Clone)]
pub struct CompiledTable {
    pub name: String,
    pub select: String,
    pub source_columns: Vec<SourceColumn>,
    pub target: TargetTable,
    pub rules: Vec<CompiledRule>,
    pub references: Vec<ReferenceSpec>,
    pub fan_out: Option<CompiledFanOut>,
    pub write: CompiledWrite,
}

impl CompiledTable {
    /// Whether any rule needs the field cipher.
    pub fn needs_cipher(&self) -> bool {
        self.rules.iter().any(|r| matches!(r.op, RuleOp::Encrypt(_)))
    }
}

impl TableSpec {
    /// Target table name after defaults.
    pub fn target_table_name(&self) -> &str {
        self.target_table.as_deref().unwrap_or(&self.name)
    }

    /// Validate the declaration and resolve names to ordinals.
    pub fn compile(&self, default_schema: &str) -> Result<CompiledTable> {
        let err = |msg: String| MigrateError::Config(format!("table '{}': {}", self.name, msg));

        if self.select.trim().is_empty() {
            return Err(err("select is required".into()));
        }
        if self.source_columns.is_empty() {
            return Err(err("source_columns must not be empty".into()));
        }
        if self.columns.is_empty() {
            return Err(err("columns must not be empty".into()));
        }

        let mut ordinals = HashMap::new();
        for (i, col) in self.source_columns.iter().enumerate() {
            if ordinals.insert(col.name.as_str(), i).is_some() {
                return Err(err(format!("duplicate source column '{}'", col.name)));
            }
        }
        let ordinal = |name: &str| -> Result<usize> {
            ordinals
                .get(name)
                .copied()
                .ok_or_else(|| err(format!("unknown source column '{}'", name)))
        };

        let mut reference_names = HashSet::new();
        for r in &self.references {
            if r.query.trim().is_empty() {
                return Err(err(format!("reference '{}' has an empty query", r.name)));
            }
            if !reference_names.insert(r.name.as_str()) {
                return Err(err(format!("duplicate reference '{}'", r.name)));
            }
        }
        let known_reference = |name: &str| -> Result<()> {
            if reference_names.contains(name) {
                Ok(())
            } else {
                Err(err(format!("unknown reference '{}'", name)))
            }
        };

        let fan_out = match &self.fan_out {
            Some(f) => {
                known_reference(&f.reference)?;
                if f.multiplier <= 0 {
                    return Err(err("fan_out.multiplier must be positive".into()));
                }
                Some(CompiledFanOut {
                    reference: f.reference.clone(),
                    base_ordinal: ordinal(&f.id_source)?,
                    multiplier: f.multiplier,
                })
            }
            None => None,
        };

        let mut seen_targets = HashSet::new();
        let mut rules = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            if !seen_targets.insert(col.name.as_str()) {
                return Err(err(format!("duplicate target column '{}'", col.name)));
            }
            let op = match &col.rule {
                ColumnRule::Direct { source } => RuleOp::Direct(ordinal(source)?),
                ColumnRule::Fixed { value } => match value {
                    None => RuleOp::Fixed(SqlValue::Null(col.ty)),
                    Some(lit) => RuleOp::Fixed(
                        lit.to_value(col.ty)
                            .map_err(|e| err(format!("column '{}': {}", col.name, e)))?,
                    ),
                },
                ColumnRule::ForeignKey {
                    source,
                    reference,
                    with,
                } => {
                    known_reference(reference)?;
                    let mut ords = vec![ordinal(source)?];
                    for extra in with {
                        ords.push(ordinal(extra)?);
                    }
                    RuleOp::ForeignKey {
                        ordinals: ords,
                        reference: reference.clone(),
                    }
                }
                ColumnRule::PasswordHash { source, output } => RuleOp::PasswordHash {
                    ordinal: ordinal(source)?,
                    part: *output,
                },
                ColumnRule::Encrypt { source } => RuleOp::Encrypt(ordinal(source)?),
                ColumnRule::Mask {
                    source,
                    visible,
                    mask_char,
                } => RuleOp::Mask {
                    ordinal: ordinal(source)?,
                    visible: *visible,
                    mask_char: *mask_char,
                },
                ColumnRule::Concat { sources, separator } => {
                    if sources.is_empty() {
                        return Err(err(format!("column '{}': concat needs sources", col.name)));
                    }
                    RuleOp::Concat {
                        ordinals: sources.iter().map(|s| ordinal(s)).collect::<Result<_>>()?,
                        separator: separator.clone(),
                    }
                }
                ColumnRule::Choose {
                    when,
                    then,
                    otherwise,
                } => RuleOp::Choose {
                    when: ordinal(when)?,
                    then: ordinal(then)?,
                    otherwise: ordinal(otherwise)?,
                },
                ColumnRule::Coalesce { sources } => {
                    if sources.is_empty() {
                        return Err(err(format!("column '{}': coalesce needs sources", col.name)));
                    }
                    RuleOp::Coalesce(sources.iter().map(|s| ordinal(s)).collect::<Result<_>>()?)
                }
                ColumnRule::FanOutId | ColumnRule::FanOutMember => {
                    if fan_out.is_none() {
                        return Err(err(format!(
                            "column '{}' uses a fan-out rule but the table has no fan_out",
                            col.name
                        )));
                    }
                    if matches!(col.rule, ColumnRule::FanOutId) {
                        RuleOp::FanOutId
                    } else {
                        RuleOp::FanOutMember
                    }
                }
            };
            rules.push(CompiledRule {
                column: col.name.clone(),
                ty: col.ty,
                op,
            });
        }

        let target = TargetTable {
            schema: self
                .target_schema
                .clone()
                .unwrap_or_else(|| default_schema.to_string()),
            name: self.target_table_name().to_string(),
            columns: self
                .columns
                .iter()
                .map(|c| TargetColumn {
                    name: c.name.clone(),
                    ty: c.ty,
                })
                .collect(),
        };

        let write = match &self.write {
            WriteMode::Bulk => CompiledWrite::Bulk,
            WriteMode::Upsert {
                key_columns,
                sequence_column,
            } => {
                if key_columns.is_empty() {
                    return Err(err("upsert requires at least one key column".into()));
                }
                let key_indexes = key_columns
                    .iter()
                    .map(|k| {
                        target
                            .column_index(k)
                            .ok_or_else(|| err(format!("unknown upsert key column '{}'", k)))
                    })
                    .collect::<Result<Vec<_>>>()?;
                CompiledWrite::Upsert {
                    key_columns: key_columns.clone(),
                    key_indexes,
                    sequence_ordinal: sequence_column.as_deref().map(ordinal).transpose()?,
                }
            }
        };

        if rules.len() != target.columns.len() {
            return Err(err(format!(
                "{} rules for {} target columns",
                rules.len(),
                target.columns.len()
            )));
        }

        Ok(CompiledTable {
            name: self.name.clone(),
            select: self.select.clone(),
            source_columns: self.source_columns.clone(),
            target,
            rules,
            references: self.references.clone(),
            fan_out,
            write,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders_yaml() -> &'static str {
        r#"
name: orders
select: SELECT OrderId, EventId, Note FROM dbo.Orders
source_columns:
  - { name: OrderId, type: int }
  - { name: EventId, type: int }
  - { name: Note, type: nvarchar }
target_table: order
columns:
  - { name: id, type: bigint, rule: { kind: direct, source: OrderId } }
  - { name: event_id, type: bigint, rule: { kind: foreign_key, source: EventId, reference: events } }
  - { name: note, type: text, rule: { kind: direct, source: Note } }
  - { name: status, type: text, rule: { kind: fixed, value: imported } }
references:
  - { name: events, query: "SELECT id FROM public.event" }
"#
    }

    #[test]
    fn test_compile_resolves_ordinals() {
        let spec: TableSpec = serde_yaml::from_str(orders_yaml()).unwrap();
        let table = spec.compile("public").unwrap();
        assert_eq!(table.target.qualified_name(), "\"public\".\"order\"");
        assert_eq!(table.rules[0].op, RuleOp::Direct(0));
        assert_eq!(
            table.rules[1].op,
            RuleOp::ForeignKey {
                ordinals: vec![1],
                reference: "events".into()
            }
        );
        assert_eq!(table.rules[3].op, RuleOp::Fixed(SqlValue::Text("imported".into())));
        assert_eq!(table.write, CompiledWrite::Bulk);
    }

    #[test]
    fn test_compile_rejects_unknown_source_column() {
        let mut spec: TableSpec = serde_yaml::from_str(orders_yaml()).unwrap();
        spec.columns[2].rule = ColumnRule::Direct {
            source: "Missing".into(),
        };
        let err = spec.compile("public").unwrap_err();
        assert!(err.to_string().contains("unknown source column 'Missing'"));
    }

    #[test]
    fn test_compile_rejects_unknown_reference() {
        let mut spec: TableSpec = serde_yaml::from_str(orders_yaml()).unwrap();
        spec.references.clear();
        assert!(spec.compile("public").is_err());
    }

    #[test]
    fn test_compile_rejects_fan_out_rule_without_fan_out() {
        let mut spec: TableSpec = serde_yaml::from_str(orders_yaml()).unwrap();
        spec.columns[0].rule = ColumnRule::FanOutId;
        let err = spec.compile("public").unwrap_err();
        assert!(err.to_string().contains("no fan_out"));
    }

    #[test]
    fn test_compile_upsert_keys() {
        let mut spec: TableSpec = serde_yaml::from_str(orders_yaml()).unwrap();
        spec.write = WriteMode::Upsert {
            key_columns: vec!["id".into()],
            sequence_column: Some("OrderId".into()),
        };
        let table = spec.compile("public").unwrap();
        assert_eq!(
            table.write,
            CompiledWrite::Upsert {
                key_columns: vec!["id".into()],
                key_indexes: vec![0],
                sequence_ordinal: Some(0),
            }
        );

        spec.write = WriteMode::Upsert {
            key_columns: vec!["nope".into()],
            sequence_column: None,
        };
        assert!(spec.compile("public").is_err());
    }

    #[test]
    fn test_bad_fixed_literal_is_config_error() {
        let mut spec: TableSpec = serde_yaml::from_str(orders_yaml()).unwrap();
        spec.columns[0].rule = ColumnRule::Fixed {
            value: Some(super::super::rules::Literal::Text("abc".into())),
        };
        assert!(matches!(spec.compile("public"), Err(MigrateError::Config(_))));
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
