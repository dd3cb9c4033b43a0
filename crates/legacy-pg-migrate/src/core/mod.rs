//! Core data types shared by every stage of the pipeline.
//!
//! - [`value`]: typed SQL values and declared column types
//! - [`row`]: source rows, target records and batches

pub mod row;
pub mod value;

pub use row::{Batch, SourceRow, TargetRecord};
pub use value::{SqlType, SqlValue, TypedNull};
