//! Reference key sets loaded from the target before a table run.
//!
//! A set is built once and then only read. Transform workers share it through
//! an `Arc` for O(1) foreign-key membership checks.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::SqlValue;
use crate::error::{MigrateError, Result};
use crate::mapping::ReferenceSpec;
use crate::target::TargetStore;

/// A key value from a reference table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReferenceKey {
    Int(i64),
    Text(String),
    Composite(Vec<ReferenceKey>),
}

impl ReferenceKey {
    /// Key for a non-null value. Integers of any width compare equal, and so
    /// do text renderings of uuids, decimals and dates.
    pub fn from_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::Null(_) => None,
            SqlValue::I16(_) | SqlValue::I32(_) | SqlValue::I64(_) | SqlValue::Bool(_) => {
                value.as_i64().map(ReferenceKey::Int)
            }
            SqlValue::Decimal(d) if d.fract().is_zero() => {
                value.as_i64().map(ReferenceKey::Int).or_else(|| Some(ReferenceKey::Text(d.to_string())))
            }
            SqlValue::Text(s) => Some(ReferenceKey::Text(s.clone())),
            SqlValue::Uuid(u) => Some(ReferenceKey::Text(u.to_string())),
            other => Some(ReferenceKey::Text(other.to_string())),
        }
    }

    /// Composite key from several values. `None` if any part is null.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a SqlValue>) -> Option<Self> {
        let mut parts: Vec<ReferenceKey> = values
            .into_iter()
            .map(ReferenceKey::from_value)
            .collect::<Option<_>>()?;
        if parts.len() == 1 {
            parts.pop()
        } else {
            Some(ReferenceKey::Composite(parts))
        }
    }

    /// Value used when a fan-out record carries its member key.
    pub fn to_value(&self) -> SqlValue {
        match self {
            ReferenceKey::Int(i) => SqlValue::I64(*i),
            ReferenceKey::Text(s) => SqlValue::Text(s.clone()),
            ReferenceKey::Composite(_) => SqlValue::Text(self.to_string()),
        }
    }
}

impl fmt::Display for ReferenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceKey::Int(i) => write!(f, "{}", i),
            ReferenceKey::Text(s) => f.write_str(s),
            ReferenceKey::Composite(parts) => {
                let rendered: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", rendered.join(","))
            }
        }
    }
}

/// What to do when a reference query fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceLoadPolicy {
    /// Continue with an empty set: every row gated on it is skipped.
    #[default]
    FailClosed,
    /// Fail the table run.
    Abort,
}

/// Keys present in a target lookup table at run start.
#[derive(Debug, Clone)]
pub struct ReferenceKeySet {
    name: String,
    keys: HashSet<ReferenceKey>,
    ordered: Vec<ReferenceKey>,
    failed: bool,
}

impl ReferenceKeySet {
    pub fn new(name: impl Into<String>, keys: impl IntoIterator<Item = ReferenceKey>) -> Self {
        let keys: HashSet<ReferenceKey> = keys.into_iter().collect();
        let mut ordered: Vec<ReferenceKey> = keys.iter().cloned().collect();
        ordered.sort();
        Self {
            name: name.into(),
            keys,
            ordered,
            failed: false,
        }
    }

    /// Empty set standing in for one whose load query failed.
    pub fn unavailable(name: impl Into<String>) -> Self {
        let mut set = Self::new(name, std::iter::empty());
        set.failed = true;
        set
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains(&self, key: &ReferenceKey) -> bool {
        self.keys.contains(key)
    }

    /// Members in ascending key order.
    pub fn members(&self) -> &[ReferenceKey] {
        &self.ordered
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// True when the load query failed and the set is empty by policy.
    pub fn is_unavailable(&self) -> bool {
        self.failed
    }
}

/// The reference sets one table needs, by name.
#[derive(Debug, Clone, Default)]
pub struct ReferenceCache {
    sets: HashMap<String, Arc<ReferenceKeySet>>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load one set from the target store.
    pub async fn load(
        store: &dyn TargetStore,
        spec: &ReferenceSpec,
        policy: ReferenceLoadPolicy,
    ) -> Result<ReferenceKeySet> {
        match store.load_keys(&spec.query).await {
            Ok(keys) => {
                let set = ReferenceKeySet::new(&spec.name, keys);
                info!("Loaded reference set '{}' ({} keys)", spec.name, set.len());
                Ok(set)
            }
            Err(e) => match policy {
                ReferenceLoadPolicy::FailClosed => {
                    warn!(
                        "Reference set '{}' failed to load, rows that depend on it will be skipped: {}",
                        spec.name, e
                    );
                    Ok(ReferenceKeySet::unavailable(&spec.name))
                }
                ReferenceLoadPolicy::Abort => Err(MigrateError::Reference {
                    name: spec.name.clone(),
                    message: e.to_string(),
                }),
            },
        }
    }

    /// Load every set a table declares.
    pub async fn load_all(
        store: &dyn TargetStore,
        specs: &[ReferenceSpec],
        policy: ReferenceLoadPolicy,
    ) -> Result<Self> {
        let mut cache = Self::new();
        for spec in specs {
            let set = Self::load(store, spec, policy).await?;
            cache.insert(set);
        }
        Ok(cache)
    }

    pub fn insert(&mut self, set: ReferenceKeySet) {
        self.sets.insert(set.name().to_string(), Arc::new(set));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ReferenceKeySet>> {
        self.sets.get(name)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
