use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::error::{Error, Result};
use crate::partition::{PartitionKey, SequenceNumber};
use crate::progress::{BatchId, BatchPlan, ProgressRecord};

/// Maximum number of events one batch may read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimits {
    default: u64,
    overrides: HashMap<PartitionKey, u64>,
}

impl RateLimits {
    pub fn new(max_events_per_partition: u64) -> Self {
        Self {
            default: max_events_per_partition,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, partition: PartitionKey, max_events: u64) -> Self {
        self.overrides.insert(partition, max_events);
        self
    }

    pub fn max_events(&self, partition: &PartitionKey) -> u64 {
        self.overrides
            .get(partition)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Computes the read range of the next batch from the committed progress and the newest event of
/// every partition.
#[derive(Debug, Clone)]
pub struct BatchPlanner {
    rate_limits: RateLimits,
}

impl BatchPlanner {
    pub fn new(rate_limits: RateLimits) -> Self {
        Self { rate_limits }
    }

    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Plans batch `batch_id` for every partition of `current`.
    ///
    /// All partitions are planned from the same snapshot: if `latest` is missing any of them the
    /// call fails with [Error::LatestPositionUnavailable] rather than planning the reachable ones.
    /// Returns `None` when no partition can move forward.
    pub fn plan(
        &self,
        batch_id: BatchId,
        current: &ProgressRecord,
        latest: &BTreeMap<PartitionKey, SequenceNumber>,
    ) -> Result<Option<BatchPlan>> {
        let unavailable: Vec<PartitionKey> = current
            .partitions()
            .filter(|partition| !latest.contains_key(*partition))
            .cloned()
            .collect();
        if !unavailable.is_empty() {
            return Err(Error::LatestPositionUnavailable(unavailable));
        }

        let mut advanced = false;
        let targets: ProgressRecord = current
            .iter()
            .map(|(partition, committed)| {
                let target = capped_target(
                    committed,
                    latest.get(partition).copied().unwrap_or(committed),
                    self.rate_limits.max_events(partition),
                );
                advanced |= target > committed;
                (partition.clone(), target)
            })
            .collect();

        if !advanced {
            debug!(batch_id, "No partition has new events, skipping batch");
            return Ok(None);
        }
        Ok(Some(BatchPlan::new(batch_id, current.clone(), targets)))
    }
}

/// `min(committed + max_events, latest)`, never below `committed`.
fn capped_target(
    committed: SequenceNumber,
    latest: SequenceNumber,
    max_events: u64,
) -> SequenceNumber {
    let max_events = SequenceNumber::try_from(max_events).unwrap_or(SequenceNumber::MAX);
    committed
        .saturating_add(max_events)
        .min(latest)
        .max(committed)
}
