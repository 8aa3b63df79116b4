use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::partition::{PartitionKey, SequenceNumber};
use crate::position::ResolvedPosition;

/// Generator is an in-memory event hub for load testing and local runs.
pub mod generator;

#[cfg(test)]
pub(crate) mod test_utils;

/// A raw event as read from an event hub partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    pub partition: PartitionKey,
    pub sequence_number: SequenceNumber,
    /// Opaque byte offset assigned by the event hub.
    pub offset: String,
    pub enqueued_time: DateTime<Utc>,
    pub body: Bytes,
}

/// The record-fetch client the connector reads an event hub through. Timeouts and retries of the
/// underlying transport are the implementor's concern.
#[trait_variant::make(EventHubClient: Send)]
pub trait LocalEventHubClient {
    /// Sequence number of the newest event in the partition, `-1` when the partition is empty.
    async fn latest_sequence_number(&self, partition: &PartitionKey) -> Result<SequenceNumber>;

    /// Events with `from_exclusive < sequence_number <= to_inclusive`, in sequence order.
    async fn fetch(
        &self,
        partition: &PartitionKey,
        from_exclusive: SequenceNumber,
        to_inclusive: SequenceNumber,
    ) -> Result<Vec<EventData>>;

    /// Sequence number of the first event a reader starting at `position` receives. For a position
    /// past the newest event this is `latest + 1`.
    async fn first_sequence_number(
        &self,
        partition: &PartitionKey,
        position: &ResolvedPosition,
    ) -> Result<SequenceNumber>;
}
