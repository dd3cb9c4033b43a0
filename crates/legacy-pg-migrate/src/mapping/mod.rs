//! Table mapping declarations: column rules, table specs and mapping metadata.

mod logics;
mod rules;
mod table;

pub use logics::{MigrationLogic, MigrationLogics};
pub use rules::{ColumnRule, HashPart, Literal};
pub use table::{
    quote_ident, ColumnSpec, CompiledFanOut, CompiledRule, CompiledTable, CompiledWrite,
    FanOutSpec, ReferenceSpec, RuleOp, SourceColumn, TableSpec, TargetColumn, TargetTable,
    WriteMode,
};
