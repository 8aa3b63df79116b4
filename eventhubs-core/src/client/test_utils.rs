use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::client::generator::GeneratorClient;
use crate::client::{EventData, EventHubClient};
use crate::error::{Error, Result};
use crate::partition::{PartitionKey, SequenceNumber};
use crate::position::ResolvedPosition;

/// Wraps a [GeneratorClient] and fails the calls for selected partitions.
#[derive(Clone)]
pub(crate) struct FaultyClient {
    pub(crate) inner: GeneratorClient,
    latest_failures: Arc<parking_lot::Mutex<HashSet<u32>>>,
    fetch_failures: Arc<parking_lot::Mutex<HashSet<u32>>>,
    fetch_calls: Arc<AtomicUsize>,
}

impl FaultyClient {
    pub(crate) fn new(inner: GeneratorClient) -> Self {
        Self {
            inner,
            latest_failures: Default::default(),
            fetch_failures: Default::default(),
            fetch_calls: Default::default(),
        }
    }

    /// Creates a client over `partition_count` partitions of the `hub` event hub, each holding
    /// `events` events.
    pub(crate) fn with_events(partition_count: u32, events: usize) -> Self {
        let inner = GeneratorClient::new("hub", partition_count);
        for partition in 0..partition_count {
            for i in 0..events {
                inner
                    .append(partition, format!("p{partition}-e{i}").into())
                    .unwrap();
            }
        }
        Self::new(inner)
    }

    pub(crate) fn fail_latest(&self, partition: u32, fail: bool) {
        toggle(&self.latest_failures, partition, fail);
    }

    pub(crate) fn fail_fetch(&self, partition: u32, fail: bool) {
        toggle(&self.fetch_failures, partition, fail);
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::Relaxed)
    }
}

fn toggle(set: &parking_lot::Mutex<HashSet<u32>>, partition: u32, fail: bool) {
    let mut set = set.lock();
    if fail {
        set.insert(partition);
    } else {
        set.remove(&partition);
    }
}

impl EventHubClient for FaultyClient {
    async fn latest_sequence_number(&self, partition: &PartitionKey) -> Result<SequenceNumber> {
        if self.latest_failures.lock().contains(&partition.partition) {
            return Err(Error::Client(format!("{partition} is unreachable")));
        }
        self.inner.latest_sequence_number(partition).await
    }

    async fn fetch(
        &self,
        partition: &PartitionKey,
        from_exclusive: SequenceNumber,
        to_inclusive: SequenceNumber,
    ) -> Result<Vec<EventData>> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        if self.fetch_failures.lock().contains(&partition.partition) {
            return Err(Error::Client(format!("fetch from {partition} timed out")));
        }
        self.inner
            .fetch(partition, from_exclusive, to_inclusive)
            .await
    }

    async fn first_sequence_number(
        &self,
        partition: &PartitionKey,
        position: &ResolvedPosition,
    ) -> Result<SequenceNumber> {
        self.inner.first_sequence_number(partition, position).await
    }
}
