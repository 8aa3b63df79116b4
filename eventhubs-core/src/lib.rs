//! Offset checkpointing and batch planning for streaming an event hub into a micro-batch engine
//! with at-least-once delivery.
//!
//! Per tick the [StreamSource] plans a rate limited range per partition, the host reads it through
//! [StreamSource::get_batch] and reports the batch as completed to the [CheckpointCoordinator],
//! which commits the new progress to the [ProgressLedger]. After a crash at most the one
//! outstanding batch is delivered again.

pub use crate::error::{Error, Result};

mod error;

/// Event hub partitions and sequence numbers.
pub mod partition;
pub use crate::partition::{PartitionKey, SequenceNumber};

/// Where to start reading a partition.
pub mod position;
pub use crate::position::{EventPosition, ResolvedPosition};

/// Progress records, batch plans and ledger entries.
pub mod progress;
pub use crate::progress::{BatchId, BatchPlan, CheckpointEntry, ProgressRecord};

/// Durable, append-only record of the committed progress.
pub mod ledger;
pub use crate::ledger::ProgressLedger;

/// Rate limited planning of the next batch.
pub mod planner;
pub use crate::planner::{BatchPlanner, RateLimits};

/// Commits batches once the host reports them as consumed.
pub mod coordinator;
pub use crate::coordinator::{BatchCompletionListener, CheckpointCoordinator};

/// The client the event hub is read through.
pub mod client;

/// The operations the host engine drives.
pub mod source;
pub use crate::source::{RecordBatch, SourceConfig, StreamSource};

/// Sequential tick loop standing in for the host engine.
pub mod forwarder;

pub mod config;

pub mod metrics;
