//! Value types flowing between the planner, the coordinator and the ledger. All of them are
//! immutable snapshots: a commit produces a new [ProgressRecord] rather than editing one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::partition::{PartitionKey, SequenceNumber};

/// Monotonically increasing identifier of a micro-batch.
pub type BatchId = i64;

/// Batch id of the entry written when a fresh job seeds the ledger from its starting positions.
/// The first planned batch is therefore `0`.
pub const SEED_BATCH_ID: BatchId = -1;

/// Last committed sequence number per partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<PartitionProgress>", into = "Vec<PartitionProgress>")]
pub struct ProgressRecord {
    partitions: BTreeMap<PartitionKey, SequenceNumber>,
}

impl ProgressRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition: &PartitionKey) -> Option<SequenceNumber> {
        self.partitions.get(partition).copied()
    }

    pub fn contains(&self, partition: &PartitionKey) -> bool {
        self.partitions.contains_key(partition)
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PartitionKey, SequenceNumber)> {
        self.partitions.iter().map(|(k, v)| (k, *v))
    }

    pub fn partitions(&self) -> impl Iterator<Item = &PartitionKey> {
        self.partitions.keys()
    }

    /// Returns a new record with `updates` applied on top of this one. A partition never moves
    /// backwards; an update lower than the current value is ignored.
    pub fn advance(
        &self,
        updates: impl IntoIterator<Item = (PartitionKey, SequenceNumber)>,
    ) -> ProgressRecord {
        let mut partitions = self.partitions.clone();
        for (partition, sequence_number) in updates {
            partitions
                .entry(partition)
                .and_modify(|current| *current = (*current).max(sequence_number))
                .or_insert(sequence_number);
        }
        ProgressRecord { partitions }
    }

    /// Returns a new record that additionally holds the partitions of `defaults` this record does
    /// not know about. Known partitions keep their value.
    pub fn with_defaults(&self, defaults: &ProgressRecord) -> ProgressRecord {
        let mut partitions = self.partitions.clone();
        for (partition, sequence_number) in defaults.iter() {
            partitions
                .entry(partition.clone())
                .or_insert(sequence_number);
        }
        ProgressRecord { partitions }
    }
}

impl FromIterator<(PartitionKey, SequenceNumber)> for ProgressRecord {
    fn from_iter<T: IntoIterator<Item = (PartitionKey, SequenceNumber)>>(iter: T) -> Self {
        Self {
            partitions: iter.into_iter().collect(),
        }
    }
}

/// Serialized form of a single partition's progress. JSON maps only take string keys, so the
/// record is stored as a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartitionProgress {
    name: String,
    partition: u32,
    sequence_number: SequenceNumber,
}

impl From<Vec<PartitionProgress>> for ProgressRecord {
    fn from(entries: Vec<PartitionProgress>) -> Self {
        entries
            .into_iter()
            .map(|p| (PartitionKey::new(p.name, p.partition), p.sequence_number))
            .collect()
    }
}

impl From<ProgressRecord> for Vec<PartitionProgress> {
    fn from(record: ProgressRecord) -> Self {
        record
            .partitions
            .into_iter()
            .map(|(key, sequence_number)| PartitionProgress {
                name: key.name,
                partition: key.partition,
                sequence_number,
            })
            .collect()
    }
}

/// The read range of one micro-batch: for every partition, read `(start, target]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    batch_id: BatchId,
    start: ProgressRecord,
    targets: ProgressRecord,
}

impl BatchPlan {
    pub(crate) fn new(batch_id: BatchId, start: ProgressRecord, targets: ProgressRecord) -> Self {
        Self {
            batch_id,
            start,
            targets,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Progress the plan was computed from.
    pub fn start(&self) -> &ProgressRecord {
        &self.start
    }

    /// Inclusive sequence number to read up to, per partition.
    pub fn targets(&self) -> &ProgressRecord {
        &self.targets
    }

    pub fn target(&self, partition: &PartitionKey) -> Option<SequenceNumber> {
        self.targets.get(partition)
    }

    /// Total number of events the plan covers.
    pub fn planned_events(&self) -> u64 {
        self.targets
            .iter()
            .map(|(partition, target)| {
                let start = self.start.get(partition).unwrap_or(target);
                u64::try_from(target - start).unwrap_or(0)
            })
            .sum()
    }
}

/// A durable ledger record: the progress that became current as of `batch_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEntry {
    pub batch_id: BatchId,
    pub progress: ProgressRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(values: &[(u32, SequenceNumber)]) -> ProgressRecord {
        values
            .iter()
            .map(|(p, s)| (PartitionKey::new("hub", *p), *s))
            .collect()
    }

    #[test]
    fn test_advance_never_regresses() {
        let current = record(&[(0, 10), (1, 5)]);
        let next = current.advance(vec![
            (PartitionKey::new("hub", 0), 7),
            (PartitionKey::new("hub", 1), 9),
            (PartitionKey::new("hub", 2), 0),
        ]);

        assert_eq!(next, record(&[(0, 10), (1, 9), (2, 0)]));
        // the original snapshot is untouched
        assert_eq!(current, record(&[(0, 10), (1, 5)]));
    }

    #[test]
    fn test_with_defaults_keeps_known_partitions() {
        let restored = record(&[(0, 10)]);
        let seeded = record(&[(0, -1), (1, -1)]);
        assert_eq!(restored.with_defaults(&seeded), record(&[(0, 10), (1, -1)]));
    }

    #[test]
    fn test_planned_events() {
        let plan = BatchPlan::new(4, record(&[(0, -1), (1, 5)]), record(&[(0, 2), (1, 5)]));
        assert_eq!(plan.planned_events(), 3);
        assert_eq!(plan.target(&PartitionKey::new("hub", 0)), Some(2));
    }

    #[test]
    fn test_checkpoint_entry_json_shape() {
        let entry = CheckpointEntry {
            batch_id: 3,
            progress: record(&[(0, 2)]),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "batchId": 3,
                "progress": [{"name": "hub", "partition": 0, "sequenceNumber": 2}]
            })
        );
    }
}
