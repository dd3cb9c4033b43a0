//! Pipeline stages between the extraction stream and the target.
//!
//! - [`BoundedQueue`]: the raw-row and batch queues that connect the stages
//! - [`TransformWorker`]: turns source rows into batches of target records
//! - [`BulkWriter`]: drains the batch queue into bulk sessions
//! - [`SequencedUpsert`]: the ordered, single-threaded path for upsert tables
//!
//! Every stage returns its own `Result`; the transfer engine joins them and
//! reports the first primary failure.

mod buffers;
mod queue;
mod sequenced;
mod worker;
mod writer;

pub use buffers::BatchPool;
pub use queue::{BoundedQueue, QueueError};
pub use sequenced::SequencedUpsert;
pub use worker::{TransformWorker, WorkerState, WorkerStats};
pub use writer::{BulkWriter, SessionMode};
