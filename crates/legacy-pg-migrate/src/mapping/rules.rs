//! Per-column transformation rules as declared in configuration.

use serde::{Deserialize, Serialize};

use crate::core::{SqlType, SqlValue};

/// How one target column gets its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnRule {
    /// Copy a source column, converted to the target type.
    Direct { source: String },

    /// Ignore the source and emit a constant. A missing `value` means NULL.
    Fixed {
        #[serde(default)]
        value: Option<Literal>,
    },

    /// Copy a source column after checking it exists in a reference set.
    /// A NULL value passes through; a present value missing from the set
    /// skips the whole row. `with` adds further source columns for a
    /// composite key.
    ForeignKey {
        source: String,
        reference: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        with: Vec<String>,
    },

    /// One half of a salted password hash. Both halves of the same source
    /// column share one hashing call per row.
    PasswordHash { source: String, output: HashPart },

    /// Symmetric encryption of the text value.
    Encrypt { source: String },

    /// Replace all but the last `visible` characters with `mask_char`.
    Mask {
        source: String,
        #[serde(default = "default_visible")]
        visible: usize,
        #[serde(default = "default_mask_char")]
        mask_char: char,
    },

    /// Join non-null text renderings of several columns.
    Concat {
        sources: Vec<String>,
        #[serde(default)]
        separator: String,
    },

    /// `then` when the `when` column is truthy, else `otherwise`.
    Choose {
        when: String,
        then: String,
        otherwise: String,
    },

    /// First non-null of several columns.
    Coalesce { sources: Vec<String> },

    /// Deterministic id of a fan-out record.
    FanOutId,

    /// The reference key this fan-out record was expanded for.
    FanOutMember,
}

/// Which half of a password hash a column receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashPart {
    Hash,
    Salt,
}

/// A constant usable in a `fixed` rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Literal {
    /// Materialize the literal as a value of the column type.
    pub fn to_value(&self, ty: SqlType) -> std::result::Result<SqlValue, String> {
        let raw = match self {
            Literal::Bool(b) => SqlValue::Bool(*b),
            Literal::Int(i) => SqlValue::I64(*i),
            Literal::Float(f) => SqlValue::F64(*f),
            Literal::Text(s) => SqlValue::Text(s.clone()),
        };
        raw.coerce(ty)
    }
}

impl ColumnRule {
    /// Source columns this rule reads, in the order it reads them.
    pub fn sources(&self) -> Vec<&str> {
        match self {
            ColumnRule::Direct { source }
            | ColumnRule::PasswordHash { source, .. }
            | ColumnRule::Encrypt { source }
            | ColumnRule::Mask { source, .. } => vec![source.as_str()],
            ColumnRule::ForeignKey { source, with, .. } => std::iter::once(source.as_str())
                .chain(with.iter().map(String::as_str))
                .collect(),
            ColumnRule::Concat { sources, .. } | ColumnRule::Coalesce { sources } => {
                sources.iter().map(String::as_str).collect()
            }
            ColumnRule::Choose {
                when,
                then,
                otherwise,
            } => vec![when.as_str(), then.as_str(), otherwise.as_str()],
            ColumnRule::Fixed { .. } | ColumnRule::FanOutId | ColumnRule::FanOutMember => Vec::new(),
        }
    }

    /// Human-readable description for mapping metadata.
    pub fn describe(&self) -> String {
        match self {
            ColumnRule::Direct { .. } => "Direct copy".to_string(),
            ColumnRule::Fixed { value: None } => "Fixed default: NULL".to_string(),
            ColumnRule::Fixed { value: Some(v) } => format!("Fixed default: {}", v),
            ColumnRule::ForeignKey { reference, .. } => {
                format!("Foreign key lookup in {}; rows with unknown keys are skipped", reference)
            }
            ColumnRule::PasswordHash { output, .. } => match output {
                HashPart::Hash => "Password hash".to_string(),
                HashPart::Salt => "Password hash salt".to_string(),
            },
            ColumnRule::Encrypt { .. } => "Encrypted (AES-256-GCM)".to_string(),
            ColumnRule::Mask { visible, .. } => {
                format!("Masked, last {} characters visible", visible)
            }
            ColumnRule::Concat { sources, separator } => {
                format!("Concatenation of {} separated by {:?}", sources.join(", "), separator)
            }
            ColumnRule::Choose {
                when,
                then,
                otherwise,
            } => format!("{} when {} is set, otherwise {}", then, when, otherwise),
            ColumnRule::Coalesce { sources } => {
                format!("First non-null of {}", sources.join(", "))
            }
            ColumnRule::FanOutId => "Deterministic id: base * multiplier + sequence".to_string(),
            ColumnRule::FanOutMember => "Fan-out reference member".to_string(),
        }
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::Bool(v) => write!(f, "{}", v),
            Literal::Int(v) => write!(f, "{}", v),
            Literal::Float(v) => write!(f, "{}", v),
            Literal::Text(v) => write!(f, "'{}'", v),
        }
    }
}

fn default_visible() -> usize {
    4
}

fn default_mask_char() -> char {
    '*'
}
