use std::fmt;

use serde::{Deserialize, Serialize};

/// Partition-local position of an event. Committed progress records the last processed sequence
/// number, so `-1` means nothing in that partition was processed yet.
pub type SequenceNumber = i64;

/// Progress value for a partition where nothing has been processed.
pub const NOTHING_PROCESSED: SequenceNumber = -1;

/// Identifies one ordered partition of an event hub.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    /// Name of the event hub (the logical stream).
    pub name: String,
    /// Index of the partition within the event hub.
    pub partition: u32,
}

impl PartitionKey {
    pub fn new(name: impl Into<String>, partition: u32) -> Self {
        Self {
            name: name.into(),
            partition,
        }
    }

    /// All the partitions of an event hub with `count` partitions.
    pub fn all(name: &str, count: u32) -> Vec<PartitionKey> {
        (0..count).map(|p| PartitionKey::new(name, p)).collect()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.partition)
    }
}
