//! The progress ledger is the only durable state of the connector. Every commit appends one
//! immutable [CheckpointEntry] artifact named after its batch id; the current progress is the entry
//! with the highest batch id. Artifacts are staged under a unique name and published with a single
//! atomic step, so a crash mid-write leaves at most an invisible staging leftover.
//!
//! Readers are served from an in-memory pointer to the latest entry and never wait for a commit
//! in flight; commits are serialized by a single writer lock.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::metrics::{connector_metrics, partition_labels};
use crate::progress::{BatchId, CheckpointEntry, ProgressRecord};

/// Encoding and integrity checks of a single ledger entry.
mod codec;

/// Durable storage the ledger is written to.
pub mod store;

pub use store::{ArtifactStore, FsArtifactStore, InMemoryArtifactStore, StagedArtifact};

const CHECKPOINT_PREFIX: &str = "checkpoint-";

fn artifact_name(batch_id: BatchId) -> String {
    format!("{CHECKPOINT_PREFIX}{batch_id}")
}

fn parse_artifact_name(name: &str) -> Option<BatchId> {
    name.strip_prefix(CHECKPOINT_PREFIX)?.parse().ok()
}

pub struct ProgressLedger<S> {
    store: S,
    /// Single-writer discipline; held for the whole stage + publish sequence.
    writer: tokio::sync::Mutex<()>,
    /// Latest published entry. Swapped only after the publish succeeded.
    current: parking_lot::RwLock<Option<Arc<CheckpointEntry>>>,
}

impl<S> ProgressLedger<S>
where
    S: ArtifactStore + Sync,
{
    /// Opens the ledger and recovers the latest entry. A latest entry that cannot be read or fails
    /// its integrity check aborts the open; older entries are never used as a fallback.
    pub async fn open(store: S) -> Result<Self> {
        match store.cleanup_staged().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Removed unpublished checkpoint artifacts"),
            Err(e) => warn!(?e, "Failed to remove unpublished checkpoint artifacts"),
        }

        let latest = Self::list_batch_ids(&store).await?.into_iter().max();
        let current = match latest {
            None => {
                info!("Checkpoint ledger is empty");
                None
            }
            Some(batch_id) => {
                let name = artifact_name(batch_id);
                let data = store.read(&name).await?;
                let entry = codec::decode(&name, &data)?;
                if entry.batch_id != batch_id {
                    return Err(Error::CorruptCheckpoint {
                        artifact: name,
                        reason: format!("artifact holds batch {}", entry.batch_id),
                    });
                }
                info!(
                    batch_id,
                    partitions = entry.progress.len(),
                    "Recovered checkpoint ledger"
                );
                record_metrics(&entry);
                Some(Arc::new(entry))
            }
        };

        Ok(Self {
            store,
            writer: tokio::sync::Mutex::new(()),
            current: parking_lot::RwLock::new(current),
        })
    }

    /// Progress of the latest committed entry, empty if nothing was committed yet.
    pub fn read_current(&self) -> ProgressRecord {
        self.current
            .read()
            .as_ref()
            .map(|entry| entry.progress.clone())
            .unwrap_or_default()
    }

    pub fn last_committed_batch_id(&self) -> Option<BatchId> {
        self.current.read().as_ref().map(|entry| entry.batch_id)
    }

    /// Durably appends `progress` as the entry for `batch_id`.
    ///
    /// Fails with [Error::StaleCommit] if `batch_id` is not after the last committed batch, with
    /// [Error::InvalidArgument] if a partition would move backwards, and with
    /// [Error::CheckpointWrite] if the write fails. The visible state is unchanged on any error.
    pub async fn commit(&self, batch_id: BatchId, progress: ProgressRecord) -> Result<()> {
        let _writer = self.writer.lock().await;

        let previous = self.current.read().clone();
        if let Some(previous) = &previous {
            if batch_id <= previous.batch_id {
                connector_metrics().stale_commits_total.inc();
                return Err(Error::StaleCommit {
                    batch_id,
                    last_committed: previous.batch_id,
                });
            }
            for (partition, committed) in previous.progress.iter() {
                if let Some(next) = progress.get(partition).filter(|next| *next < committed) {
                    return Err(Error::InvalidArgument(format!(
                        "progress of {partition} would move back from {committed} to {next}"
                    )));
                }
            }
        }

        let entry = CheckpointEntry { batch_id, progress };
        let data = codec::encode(&entry)?;
        let staged = self.store.stage(data).await?;
        self.store.publish(staged, &artifact_name(batch_id)).await?;

        info!(
            batch_id,
            partitions = entry.progress.len(),
            "Committed checkpoint"
        );
        connector_metrics().commits_total.inc();
        record_metrics(&entry);
        *self.current.write() = Some(Arc::new(entry));
        Ok(())
    }

    /// Deletes all but the `retain` most recent entries and returns how many were deleted. The
    /// current entry is always kept.
    pub async fn purge(&self, retain: usize) -> Result<usize> {
        let _writer = self.writer.lock().await;

        let mut batch_ids = Self::list_batch_ids(&self.store).await?;
        batch_ids.sort_unstable_by(|a, b| b.cmp(a));

        let mut deleted = 0;
        for batch_id in batch_ids.into_iter().skip(retain.max(1)) {
            self.store.delete(&artifact_name(batch_id)).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Batch ids of every entry still present in the store, in ascending order.
    pub async fn batch_ids(&self) -> Result<Vec<BatchId>> {
        let mut batch_ids = Self::list_batch_ids(&self.store).await?;
        batch_ids.sort_unstable();
        Ok(batch_ids)
    }

    async fn list_batch_ids(store: &S) -> Result<Vec<BatchId>> {
        let names = store.list().await?;
        let mut batch_ids = Vec::with_capacity(names.len());
        for name in names {
            match parse_artifact_name(&name) {
                Some(batch_id) => batch_ids.push(batch_id),
                None => warn!(%name, "Ignoring unknown artifact in checkpoint store"),
            }
        }
        Ok(batch_ids)
    }
}

fn record_metrics(entry: &CheckpointEntry) {
    let metrics = connector_metrics();
    metrics.committed_batch.set(entry.batch_id);
    for (partition, sequence_number) in entry.progress.iter() {
        metrics
            .committed_sequence_number
            .get_or_create(&partition_labels(partition))
            .set(sequence_number);
    }
}
