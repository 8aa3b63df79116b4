use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{EventData, EventHubClient};
use crate::error::{Error, Result};
use crate::partition::{PartitionKey, SequenceNumber};
use crate::position::{END_OF_STREAM, ResolvedPosition, START_OF_STREAM};

/// How fast and what the generator produces.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorConfig {
    /// Events appended to every partition per `duration`.
    pub rpu: usize,
    pub duration: Duration,
    /// Fixed payload; when empty a counter padded to `msg_size_bytes` is used.
    pub content: Bytes,
    pub msg_size_bytes: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            rpu: 1,
            duration: Duration::from_millis(1000),
            content: Bytes::new(),
            msg_size_bytes: 8,
        }
    }
}

#[derive(Debug, Default)]
struct PartitionLog {
    events: Vec<EventData>,
    next_offset: u64,
}

impl PartitionLog {
    fn push(
        &mut self,
        partition: PartitionKey,
        body: Bytes,
        enqueued_time: DateTime<Utc>,
    ) -> SequenceNumber {
        let sequence_number = self.events.len() as SequenceNumber;
        let offset = self.next_offset;
        self.next_offset += body.len() as u64;
        self.events.push(EventData {
            partition,
            sequence_number,
            offset: offset.to_string(),
            enqueued_time,
            body,
        });
        sequence_number
    }
}

/// An event hub kept entirely in memory. Sequence numbers start at 0 and offsets are the
/// cumulative byte position of each event, like the service assigns them. Cloning shares the
/// partitions, so one clone can produce while another is handed to the connector.
#[derive(Debug, Clone)]
pub struct GeneratorClient {
    event_hub: String,
    partitions: Arc<parking_lot::RwLock<BTreeMap<u32, PartitionLog>>>,
}

impl GeneratorClient {
    pub fn new(event_hub: impl Into<String>, partition_count: u32) -> Self {
        let partitions = (0..partition_count)
            .map(|p| (p, PartitionLog::default()))
            .collect();
        Self {
            event_hub: event_hub.into(),
            partitions: Arc::new(parking_lot::RwLock::new(partitions)),
        }
    }

    pub fn partitions(&self) -> Vec<PartitionKey> {
        self.partitions
            .read()
            .keys()
            .map(|p| PartitionKey::new(self.event_hub.clone(), *p))
            .collect()
    }

    /// Appends an event enqueued now and returns its sequence number.
    pub fn append(&self, partition: u32, body: Bytes) -> Result<SequenceNumber> {
        self.append_at(partition, body, Utc::now())
    }

    pub fn append_at(
        &self,
        partition: u32,
        body: Bytes,
        enqueued_time: DateTime<Utc>,
    ) -> Result<SequenceNumber> {
        let mut partitions = self.partitions.write();
        let log = partitions
            .get_mut(&partition)
            .ok_or_else(|| Error::Client(format!("partition {partition} does not exist")))?;
        Ok(log.push(
            PartitionKey::new(self.event_hub.clone(), partition),
            body,
            enqueued_time,
        ))
    }

    /// Appends `config.rpu` events to every partition each `config.duration` until cancelled.
    pub async fn run(&self, config: GeneratorConfig, cln_token: CancellationToken) {
        info!(
            event_hub = %self.event_hub,
            rpu = config.rpu,
            duration = ?config.duration,
            "Started generator"
        );
        let mut counter: u64 = 0;
        let mut ticker = tokio::time::interval(config.duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cln_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let enqueued_time = Utc::now();
            for (partition, log) in self.partitions.write().iter_mut() {
                let key = PartitionKey::new(self.event_hub.clone(), *partition);
                for _ in 0..config.rpu {
                    let body = if config.content.is_empty() {
                        generated_payload(counter, config.msg_size_bytes)
                    } else {
                        config.content.clone()
                    };
                    counter += 1;
                    log.push(key.clone(), body, enqueued_time);
                }
            }
            debug!(generated = counter, "Generator tick");
        }
        info!(generated = counter, "Stopped generator");
    }

    fn with_log<T>(
        &self,
        partition: &PartitionKey,
        f: impl FnOnce(&PartitionLog) -> Result<T>,
    ) -> Result<T> {
        if partition.name != self.event_hub {
            return Err(Error::Client(format!(
                "unknown event hub {}, expected {}",
                partition.name, self.event_hub
            )));
        }
        let partitions = self.partitions.read();
        let log = partitions
            .get(&partition.partition)
            .ok_or_else(|| Error::Client(format!("partition {partition} does not exist")))?;
        f(log)
    }
}

fn generated_payload(counter: u64, msg_size_bytes: u32) -> Bytes {
    let mut payload = counter.to_le_bytes().to_vec();
    payload.resize((msg_size_bytes as usize).max(payload.len()), 0);
    Bytes::from(payload)
}

impl EventHubClient for GeneratorClient {
    async fn latest_sequence_number(&self, partition: &PartitionKey) -> Result<SequenceNumber> {
        self.with_log(partition, |log| Ok(log.events.len() as SequenceNumber - 1))
    }

    async fn fetch(
        &self,
        partition: &PartitionKey,
        from_exclusive: SequenceNumber,
        to_inclusive: SequenceNumber,
    ) -> Result<Vec<EventData>> {
        self.with_log(partition, |log| {
            let start = usize::try_from(from_exclusive + 1).unwrap_or(0);
            let end = usize::try_from(to_inclusive + 1)
                .unwrap_or(0)
                .min(log.events.len());
            Ok(log
                .events
                .get(start..end)
                .map(<[EventData]>::to_vec)
                .unwrap_or_default())
        })
    }

    async fn first_sequence_number(
        &self,
        partition: &PartitionKey,
        position: &ResolvedPosition,
    ) -> Result<SequenceNumber> {
        self.with_log(partition, |log| {
            let end = log.events.len() as SequenceNumber;
            match position {
                ResolvedPosition::Offset { offset, .. } if offset == START_OF_STREAM => Ok(0),
                ResolvedPosition::Offset { offset, .. } if offset == END_OF_STREAM => Ok(end),
                ResolvedPosition::Offset { offset, inclusive } => {
                    let offset: u64 = offset.parse().map_err(|e| {
                        Error::Client(format!("invalid offset {offset} for {partition}: {e}"))
                    })?;
                    let found = log.events.iter().find_map(|event| {
                        // offsets were generated from u64s, parsing them back cannot fail
                        let event_offset: u64 = event.offset.parse().ok()?;
                        match event_offset.cmp(&offset) {
                            std::cmp::Ordering::Equal if *inclusive => Some(event.sequence_number),
                            std::cmp::Ordering::Equal => Some(event.sequence_number + 1),
                            std::cmp::Ordering::Greater => Some(event.sequence_number),
                            std::cmp::Ordering::Less => None,
                        }
                    });
                    Ok(found.unwrap_or(end))
                }
                ResolvedPosition::SequenceNumber {
                    sequence_number,
                    inclusive,
                } => Ok(if *inclusive {
                    *sequence_number
                } else {
                    sequence_number + 1
                }),
                ResolvedPosition::EnqueuedTime(time) => Ok(log
                    .events
                    .iter()
                    .find(|event| event.enqueued_time > *time)
                    .map_or(end, |event| event.sequence_number)),
            }
        })
    }
}
