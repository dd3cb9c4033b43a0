//! Row transformation: one source row in, zero or more target records out.
//!
//! A transformer never fails the stream. Rows that should not be written come
//! back as [`TransformOutcome::Skip`]; rows that cannot be converted come back
//! as a [`RowError`] and are counted as errored by the caller.

use std::fmt;
use std::sync::Arc;

use crate::core::{SourceRow, SqlValue, TargetRecord};
use crate::error::{MigrateError, Result, RowError};
use crate::mapping::{CompiledRule, CompiledTable, HashPart, RuleOp};
use crate::reference::{ReferenceCache, ReferenceKey, ReferenceKeySet};
use crate::security::{self, FieldCipher, HashedSecret, PasswordHasher};

/// Why a row produced no records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// A foreign-key value is not in its reference set.
    MissingReference(String),
    /// The reference set failed to load and is empty by policy.
    ReferenceUnavailable(String),
    /// Fan-out over an empty reference set.
    FanOutEmpty(String),
    /// A mandatory large value exceeded the size ceiling.
    BlobTooLarge(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingReference(r) => write!(f, "missing_reference:{}", r),
            SkipReason::ReferenceUnavailable(r) => write!(f, "reference_unavailable:{}", r),
            SkipReason::FanOutEmpty(r) => write!(f, "fan_out_empty:{}", r),
            SkipReason::BlobTooLarge(c) => write!(f, "blob_too_large:{}", c),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    Emit(Vec<TargetRecord>),
    Skip(SkipReason),
}

/// Maps source rows to target records.
pub trait RowTransformer: Send + Sync {
    fn transform(&self, row: &SourceRow) -> std::result::Result<TransformOutcome, RowError>;
}

/// Shared collaborators for rule evaluation, built once per table run.
#[derive(Clone)]
pub struct TransformContext {
    pub references: ReferenceCache,
    pub hasher: Arc<dyn PasswordHasher>,
    pub cipher: Option<Arc<dyn FieldCipher>>,
}

struct Gate {
    ordinals: Vec<usize>,
    set: Arc<ReferenceKeySet>,
}

struct FanOut {
    base_ordinal: usize,
    base_column: String,
    multiplier: i64,
    set: Arc<ReferenceKeySet>,
}

/// Transformer driven by a compiled table's column rules.
pub struct RuleTransformer {
    table: Arc<CompiledTable>,
    gates: Vec<Gate>,
    fan_out: Option<FanOut>,
    hasher: Arc<dyn PasswordHasher>,
    cipher: Option<Arc<dyn FieldCipher>>,
}

impl RuleTransformer {
    pub fn new(table: Arc<CompiledTable>, ctx: &TransformContext) -> Result<Self> {
        let lookup = |name: &str| -> Result<Arc<ReferenceKeySet>> {
            ctx.references.get(name).cloned().ok_or_else(|| {
                MigrateError::Config(format!(
                    "table '{}': reference set '{}' was not loaded",
                    table.name, name
                ))
            })
        };

        let mut gates = Vec::new();
        for rule in &table.rules {
            if let RuleOp::ForeignKey { ordinals, reference } = &rule.op {
                gates.push(Gate {
                    ordinals: ordinals.clone(),
                    set: lookup(reference)?,
                });
            }
        }

        let fan_out = match &table.fan_out {
            Some(f) => Some(FanOut {
                base_ordinal: f.base_ordinal,
                base_column: table.source_columns[f.base_ordinal].name.clone(),
                multiplier: f.multiplier,
                set: lookup(&f.reference)?,
            }),
            None => None,
        };

        if table.needs_cipher() && ctx.cipher.is_none() {
            return Err(MigrateError::Config(format!(
                "table '{}' encrypts columns but security.encryption_key is not set",
                table.name
            )));
        }

        Ok(Self {
            gates,
            fan_out,
            hasher: ctx.hasher.clone(),
            cipher: ctx.cipher.clone(),
            table,
        })
    }

    fn check_gates(&self, row: &SourceRow) -> std::result::Result<Option<SkipReason>, RowError> {
        for gate in &self.gates {
            let values = gate
                .ordinals
                .iter()
                .map(|&o| field(row, o))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let Some(key) = ReferenceKey::from_values(values) else {
                continue;
            };
            if gate.set.is_unavailable() {
                return Ok(Some(SkipReason::ReferenceUnavailable(gate.set.name().to_string())));
            }
            if !gate.set.contains(&key) {
                return Ok(Some(SkipReason::MissingReference(gate.set.name().to_string())));
            }
        }
        Ok(None)
    }

    fn evaluate(
        &self,
        rule: &CompiledRule,
        row: &SourceRow,
        member: Option<(i64, &ReferenceKey)>,
        hashes: &mut Vec<(usize, HashedSecret)>,
    ) -> std::result::Result<SqlValue, RowError> {
        let convert = |v: SqlValue| v.coerce(rule.ty).map_err(|e| RowError::conversion(&rule.column, e));
        let null = SqlValue::Null(rule.ty);

        match &rule.op {
            RuleOp::Direct(o) => convert(field(row, *o)?.clone()),
            RuleOp::Fixed(v) => Ok(v.clone()),
            RuleOp::ForeignKey { ordinals, .. } => convert(field(row, ordinals[0])?.clone()),
            RuleOp::PasswordHash { ordinal, part } => {
                let Some(plain) = field(row, *ordinal)?.to_text() else {
                    return Ok(null);
                };
                let secret = match hashes.iter().find(|(o, _)| o == ordinal) {
                    Some((_, s)) => s.clone(),
                    None => {
                        let s = self.hasher.hash(&plain).map_err(|message| RowError::Crypto {
                            column: rule.column.clone(),
                            message,
                        })?;
                        hashes.push((*ordinal, s.clone()));
                        s
                    }
                };
                let text = match part {
                    HashPart::Hash => secret.hash,
                    HashPart::Salt => secret.salt,
                };
                convert(SqlValue::Text(text))
            }
            RuleOp::Encrypt(o) => {
                let Some(plain) = field(row, *o)?.to_text() else {
                    return Ok(null);
                };
                let cipher = self.cipher.as_ref().ok_or_else(|| RowError::Crypto {
                    column: rule.column.clone(),
                    message: "no cipher configured".to_string(),
                })?;
                let ct = cipher.encrypt(&plain).map_err(|message| RowError::Crypto {
                    column: rule.column.clone(),
                    message,
                })?;
                convert(SqlValue::Text(ct))
            }
            RuleOp::Mask {
                ordinal,
                visible,
                mask_char,
            } => match field(row, *ordinal)?.to_text() {
                Some(text) => convert(SqlValue::Text(security::mask(&text, *visible, *mask_char))),
                None => Ok(null),
            },
            RuleOp::Concat { ordinals, separator } => {
                let mut parts = Vec::with_capacity(ordinals.len());
                for &o in ordinals {
                    if let Some(text) = field(row, o)?.to_text() {
                        parts.push(text);
                    }
                }
                if parts.is_empty() {
                    Ok(null)
                } else {
                    convert(SqlValue::Text(parts.join(separator)))
                }
            }
            RuleOp::Choose {
                when,
                then,
                otherwise,
            } => {
                let pick = if field(row, *when)?.is_truthy() {
                    *then
                } else {
                    *otherwise
                };
                convert(field(row, pick)?.clone())
            }
            RuleOp::Coalesce(ordinals) => {
                for &o in ordinals {
                    let v = field(row, o)?;
                    if !v.is_null() {
                        return convert(v.clone());
                    }
                }
                Ok(null)
            }
            RuleOp::FanOutId => match member {
                Some((id, _)) => convert(SqlValue::I64(id)),
                None => Err(RowError::conversion(&rule.column, "no fan-out member")),
            },
            RuleOp::FanOutMember => match member {
                Some((_, key)) => convert(key.to_value()),
                None => Err(RowError::conversion(&rule.column, "no fan-out member")),
            },
        }
    }

    fn build(
        &self,
        row: &SourceRow,
        member: Option<(i64, &ReferenceKey)>,
        hashes: &mut Vec<(usize, HashedSecret)>,
    ) -> std::result::Result<TargetRecord, RowError> {
        let mut values = Vec::with_capacity(self.table.rules.len());
        for rule in &self.table.rules {
            values.push(self.evaluate(rule, row, member, hashes)?);
        }
        Ok(TargetRecord::new(values))
    }
}

impl RowTransformer for RuleTransformer {
    fn transform(&self, row: &SourceRow) -> std::result::Result<TransformOutcome, RowError> {
        if let Some(reason) = self.check_gates(row)? {
            return Ok(TransformOutcome::Skip(reason));
        }

        let mut hashes = Vec::new();
        let Some(fan_out) = &self.fan_out else {
            return Ok(TransformOutcome::Emit(vec![self.build(row, None, &mut hashes)?]));
        };

        if fan_out.set.is_unavailable() {
            return Ok(TransformOutcome::Skip(SkipReason::ReferenceUnavailable(
                fan_out.set.name().to_string(),
            )));
        }
        let members = fan_out.set.members();
        if members.is_empty() {
            return Ok(TransformOutcome::Skip(SkipReason::FanOutEmpty(
                fan_out.set.name().to_string(),
            )));
        }

        let base = field(row, fan_out.base_ordinal)?
            .as_i64()
            .ok_or_else(|| RowError::FanOutBase(fan_out.base_column.clone()))?;

        let mut records = Vec::with_capacity(members.len());
        for (seq, member) in members.iter().enumerate() {
            let id = fan_out_id(base, fan_out.multiplier, seq as i64 + 1)?;
            records.push(self.build(row, Some((id, member)), &mut hashes)?);
        }
        Ok(TransformOutcome::Emit(records))
    }
}

/// Deterministic id of the `seq`-th (1-based) fan-out record of `base`.
pub fn fan_out_id(base: i64, multiplier: i64, seq: i64) -> std::result::Result<i64, RowError> {
    base.checked_mul(multiplier)
        .and_then(|v| v.checked_add(seq))
        .ok_or(RowError::Overflow { base })
}

fn field(row: &SourceRow, ordinal: usize) -> std::result::Result<&SqlValue, RowError> {
    row.get(ordinal).ok_or(RowError::MissingColumn(ordinal))
}
