//! The coordinator turns "batch completed" notifications of the host engine into ledger commits.
//! It commits strictly after the host reports a batch as fully consumed, which bounds re-delivery
//! after a crash to the single outstanding batch.
//!
//! The coordinator itself is not durable. After a restart a fresh instance is created and handed
//! to the host again; only the ledger survives.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::ledger::{ArtifactStore, ProgressLedger};
use crate::metrics::connector_metrics;
use crate::partition::PartitionKey;
use crate::progress::{BatchId, BatchPlan};

/// Observer the host engine calls once the output of a batch has been durably consumed.
#[trait_variant::make(BatchCompletionListener: Send)]
pub trait LocalBatchCompletionListener {
    /// `delivered` holds the number of records the host processed per partition.
    async fn on_batch_completed(
        &self,
        batch_id: BatchId,
        delivered: &BTreeMap<PartitionKey, u64>,
    ) -> Result<()>;
}

pub struct CheckpointCoordinator<S> {
    ledger: Arc<ProgressLedger<S>>,
    /// The plan handed to the host and not yet committed or abandoned.
    outstanding: parking_lot::Mutex<Option<BatchPlan>>,
    /// Number of ledger entries kept after a commit, `None` disables purging.
    retain: Option<usize>,
}

impl<S> CheckpointCoordinator<S>
where
    S: ArtifactStore + Sync,
{
    pub fn new(ledger: Arc<ProgressLedger<S>>, retain: Option<usize>) -> Self {
        Self {
            ledger,
            outstanding: parking_lot::Mutex::new(None),
            retain,
        }
    }

    /// Registers `plan` as the outstanding batch. Only one plan can be outstanding at a time.
    pub(crate) fn track(&self, plan: BatchPlan) -> Result<()> {
        let mut outstanding = self.outstanding.lock();
        if let Some(existing) = outstanding.as_ref() {
            return Err(Error::InvalidArgument(format!(
                "batch {} is still outstanding, cannot track batch {}",
                existing.batch_id(),
                plan.batch_id()
            )));
        }
        *outstanding = Some(plan);
        Ok(())
    }

    pub fn outstanding(&self) -> Option<BatchPlan> {
        self.outstanding.lock().clone()
    }

    /// Drops the outstanding plan without touching the ledger.
    pub fn abandon(&self) -> Option<BatchPlan> {
        let abandoned = self.outstanding.lock().take();
        if let Some(plan) = &abandoned {
            info!(batch_id = plan.batch_id(), "Abandoned batch");
        }
        abandoned
    }

    /// Commits every partition of `plan`, as if the host delivered its whole range.
    pub async fn commit_plan(&self, plan: &BatchPlan) -> Result<()> {
        let partitions: Vec<PartitionKey> = plan.targets().partitions().cloned().collect();
        self.commit(plan.batch_id(), partitions).await
    }

    async fn commit(&self, batch_id: BatchId, partitions: Vec<PartitionKey>) -> Result<()> {
        let plan = match self.outstanding() {
            Some(plan) if plan.batch_id() == batch_id => plan,
            _ => {
                if let Some(last_committed) = self
                    .ledger
                    .last_committed_batch_id()
                    .filter(|last| batch_id <= *last)
                {
                    connector_metrics().stale_commits_total.inc();
                    return Err(Error::StaleCommit {
                        batch_id,
                        last_committed,
                    });
                }
                return Err(Error::InvalidArgument(format!(
                    "batch {batch_id} was never planned"
                )));
            }
        };

        let updates: Vec<_> = partitions
            .into_iter()
            .filter_map(|partition| {
                let target = plan.target(&partition)?;
                Some((partition, target))
            })
            .collect();
        let progress = self
            .ledger
            .read_current()
            .with_defaults(plan.start())
            .advance(updates);

        // on failure the plan stays outstanding so the same batch can be committed again
        self.ledger.commit(batch_id, progress).await?;

        {
            let mut outstanding = self.outstanding.lock();
            if outstanding.as_ref().map(BatchPlan::batch_id) == Some(batch_id) {
                *outstanding = None;
            }
        }

        if let Some(retain) = self.retain {
            match self.ledger.purge(retain).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, retain, "Purged old checkpoints"),
                Err(e) => warn!(?e, "Failed to purge old checkpoints"),
            }
        }
        Ok(())
    }
}

impl<S> BatchCompletionListener for CheckpointCoordinator<S>
where
    S: ArtifactStore + Sync,
{
    /// Commits the planned target of every partition that delivered at least one record. Partitions
    /// that delivered nothing keep their previous progress and are read again.
    async fn on_batch_completed(
        &self,
        batch_id: BatchId,
        delivered: &BTreeMap<PartitionKey, u64>,
    ) -> Result<()> {
        let partitions = delivered
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(partition, _)| partition.clone())
            .collect();
        self.commit(batch_id, partitions).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::{BatchCompletionListener, CheckpointCoordinator};
    use crate::error::Error;
    use crate::ledger::{InMemoryArtifactStore, ProgressLedger};
    use crate::metrics::connector_metrics;
    use crate::partition::{PartitionKey, SequenceNumber};
    use crate::progress::{BatchPlan, ProgressRecord};

    fn key(partition: u32) -> PartitionKey {
        PartitionKey::new("hub", partition)
    }

    fn record(values: &[(u32, SequenceNumber)]) -> ProgressRecord {
        values.iter().map(|(p, s)| (key(*p), *s)).collect()
    }

    fn delivered(values: &[(u32, u64)]) -> BTreeMap<PartitionKey, u64> {
        values.iter().map(|(p, c)| (key(*p), *c)).collect()
    }

    async fn coordinator(
        store: InMemoryArtifactStore,
        retain: Option<usize>,
    ) -> CheckpointCoordinator<InMemoryArtifactStore> {
        let ledger = Arc::new(ProgressLedger::open(store).await.unwrap());
        ledger.commit(-1, record(&[(0, -1), (1, -1)])).await.unwrap();
        CheckpointCoordinator::new(ledger, retain)
    }

    #[tokio::test]
    async fn test_batch_completed_commits_plan() {
        let coordinator = coordinator(InMemoryArtifactStore::new(), None).await;
        let plan = BatchPlan::new(0, record(&[(0, -1), (1, -1)]), record(&[(0, 2), (1, 2)]));
        coordinator.track(plan).unwrap();

        coordinator
            .on_batch_completed(0, &delivered(&[(0, 3), (1, 3)]))
            .await
            .unwrap();

        assert_eq!(coordinator.ledger.read_current(), record(&[(0, 2), (1, 2)]));
        assert!(coordinator.outstanding().is_none());
    }

    #[tokio::test]
    async fn test_only_delivered_partitions_advance() {
        let coordinator = coordinator(InMemoryArtifactStore::new(), None).await;
        let plan = BatchPlan::new(0, record(&[(0, -1), (1, -1)]), record(&[(0, 4), (1, 4)]));
        coordinator.track(plan).unwrap();

        coordinator
            .on_batch_completed(0, &delivered(&[(0, 5), (1, 0)]))
            .await
            .unwrap();
        assert_eq!(
            coordinator.ledger.read_current(),
            record(&[(0, 4), (1, -1)])
        );
    }

    #[tokio::test]
    async fn test_duplicate_notification_is_stale() {
        let coordinator = coordinator(InMemoryArtifactStore::new(), None).await;
        let plan = BatchPlan::new(0, record(&[(0, -1), (1, -1)]), record(&[(0, 2), (1, 2)]));
        coordinator.track(plan).unwrap();
        coordinator
            .on_batch_completed(0, &delivered(&[(0, 3), (1, 3)]))
            .await
            .unwrap();

        let stale_before = connector_metrics().stale_commits_total.get();
        let err = coordinator
            .on_batch_completed(0, &delivered(&[(0, 3), (1, 3)]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::StaleCommit {
                batch_id: 0,
                last_committed: 0
            }
        ));
        // other tests share the counter, it can only have grown
        assert!(connector_metrics().stale_commits_total.get() > stale_before);
    }

    #[tokio::test]
    async fn test_unplanned_batch_rejected() {
        let coordinator = coordinator(InMemoryArtifactStore::new(), None).await;
        let err = coordinator
            .on_batch_completed(7, &delivered(&[(0, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(coordinator.ledger.last_committed_batch_id(), Some(-1));
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_plan_outstanding() {
        let store = InMemoryArtifactStore::new();
        let coordinator = coordinator(store.clone(), None).await;
        let plan = BatchPlan::new(0, record(&[(0, -1), (1, -1)]), record(&[(0, 2), (1, 2)]));
        coordinator.track(plan.clone()).unwrap();

        store.set_fail_stage(true);
        let err = coordinator.commit_plan(&plan).await.unwrap_err();
        assert!(matches!(err, Error::CheckpointWrite(_)));
        assert_eq!(coordinator.outstanding(), Some(plan.clone()));
        assert_eq!(
            coordinator.ledger.read_current(),
            record(&[(0, -1), (1, -1)])
        );

        store.set_fail_stage(false);
        coordinator.commit_plan(&plan).await.unwrap();
        assert_eq!(coordinator.ledger.read_current(), record(&[(0, 2), (1, 2)]));
    }

    #[tokio::test]
    async fn test_single_outstanding_plan() {
        let coordinator = coordinator(InMemoryArtifactStore::new(), None).await;
        let first = BatchPlan::new(0, record(&[(0, -1)]), record(&[(0, 1)]));
        let second = BatchPlan::new(1, record(&[(0, -1)]), record(&[(0, 2)]));

        coordinator.track(first.clone()).unwrap();
        assert!(coordinator.track(second.clone()).is_err());

        assert_eq!(coordinator.abandon(), Some(first));
        coordinator.track(second).unwrap();
    }

    #[tokio::test]
    async fn test_new_partition_is_persisted_on_commit() {
        let coordinator = coordinator(InMemoryArtifactStore::new(), None).await;
        // partition 2 is only known to the plan
        let plan = BatchPlan::new(
            0,
            record(&[(0, -1), (1, -1), (2, 5)]),
            record(&[(0, -1), (1, 0), (2, 6)]),
        );
        coordinator.track(plan).unwrap();
        coordinator
            .on_batch_completed(0, &delivered(&[(1, 1), (2, 1)]))
            .await
            .unwrap();
        assert_eq!(
            coordinator.ledger.read_current(),
            record(&[(0, -1), (1, 0), (2, 6)])
        );
    }

    #[tokio::test]
    async fn test_purge_after_commit() {
        let coordinator = coordinator(InMemoryArtifactStore::new(), Some(2)).await;
        for batch_id in 0..4 {
            let start = coordinator.ledger.read_current();
            let target = record(&[(0, batch_id), (1, batch_id)]);
            let plan = BatchPlan::new(batch_id, start, target);
            coordinator.track(plan.clone()).unwrap();
            coordinator.commit_plan(&plan).await.unwrap();
        }
        assert_eq!(coordinator.ledger.batch_ids().await.unwrap(), vec![2, 3]);
    }
}
