//! The stream source ties the ledger, the planner and the coordinator to an event hub client and
//! exposes the operations the host engine drives a micro-batch query with: start, get_offset,
//! get_batch and commit.
//!
//! The source carries no durable state of its own. Everything it knows after a restart is read
//! back from the ledger by [StreamSource::start].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use futures::{StreamExt, TryStreamExt, stream};
use tracing::{debug, info, warn};

use crate::client::{EventData, EventHubClient};
use crate::coordinator::CheckpointCoordinator;
use crate::error::{Error, Result};
use crate::ledger::{ArtifactStore, ProgressLedger};
use crate::metrics::{connector_metrics, event_hub_labels, partition_labels, skipped_tick_labels};
use crate::partition::{NOTHING_PROCESSED, PartitionKey, SequenceNumber};
use crate::planner::BatchPlanner;
use crate::position::EventPosition;
use crate::progress::{BatchId, BatchPlan, ProgressRecord, SEED_BATCH_ID};

const SKIP_LATEST_UNAVAILABLE: &str = "latest_unavailable";
const SKIP_NO_NEW_EVENTS: &str = "no_new_events";

/// Static configuration of a [StreamSource].
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub event_hub: String,
    pub partition_count: u32,
    /// Starting positions overriding the default one for individual partitions.
    pub starting_positions: HashMap<u32, EventPosition>,
    /// Upper bound of partitions queried at the same time.
    pub fetch_concurrency: usize,
    /// Ledger entries kept after each commit, `None` keeps every entry.
    pub min_batches_to_retain: Option<usize>,
}

impl SourceConfig {
    pub fn new(event_hub: impl Into<String>, partition_count: u32) -> Self {
        Self {
            event_hub: event_hub.into(),
            partition_count,
            starting_positions: HashMap::new(),
            fetch_concurrency: 8,
            min_batches_to_retain: Some(100),
        }
    }

    fn partitions(&self) -> Vec<PartitionKey> {
        PartitionKey::all(&self.event_hub, self.partition_count)
    }
}

/// The records of one batch, grouped by partition in sequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub batch_id: BatchId,
    pub records: BTreeMap<PartitionKey, Vec<EventData>>,
}

impl RecordBatch {
    /// Number of records per partition, the form the host reports a completed batch in.
    pub fn counts(&self) -> BTreeMap<PartitionKey, u64> {
        self.records
            .iter()
            .map(|(partition, events)| (partition.clone(), events.len() as u64))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct StreamSource<C, S> {
    config: SourceConfig,
    planner: BatchPlanner,
    client: C,
    ledger: Arc<ProgressLedger<S>>,
    coordinator: Arc<CheckpointCoordinator<S>>,
}

impl<C, S> StreamSource<C, S>
where
    C: EventHubClient + Sync,
    S: ArtifactStore + Sync,
{
    pub fn new(
        config: SourceConfig,
        planner: BatchPlanner,
        client: C,
        ledger: Arc<ProgressLedger<S>>,
    ) -> Self {
        let coordinator = Arc::new(CheckpointCoordinator::new(
            Arc::clone(&ledger),
            config.min_batches_to_retain,
        ));
        Self {
            config,
            planner,
            client,
            ledger,
            coordinator,
        }
    }

    /// Restores the progress from the ledger, seeding it from `position` on the very first run.
    ///
    /// Seeded progress is always committed before it is used. On an empty ledger it is written as
    /// the seed entry. Partitions added to the configuration later are written to a new entry right
    /// after the last committed batch, so that a restart never resolves their position again.
    pub async fn start(&self, position: &EventPosition) -> Result<ProgressRecord> {
        let restored = self.ledger.read_current();
        let missing: Vec<PartitionKey> = self
            .config
            .partitions()
            .into_iter()
            .filter(|partition| !restored.contains(partition))
            .collect();

        let seeds: ProgressRecord = futures::future::try_join_all(missing.into_iter().map(
            |partition| async move {
                let position = self
                    .config
                    .starting_positions
                    .get(&partition.partition)
                    .unwrap_or(position);
                let progress = self.seed_progress(&partition, position).await?;
                Ok::<_, Error>((partition, progress))
            },
        ))
        .await?
        .into_iter()
        .collect();

        match self.ledger.last_committed_batch_id() {
            None => {
                self.ledger.commit(SEED_BATCH_ID, seeds.clone()).await?;
                info!(
                    event_hub = %self.config.event_hub,
                    partitions = seeds.len(),
                    "Seeded checkpoint ledger from the starting position"
                );
            }
            Some(batch_id) if !seeds.is_empty() => {
                self.ledger
                    .commit(batch_id + 1, restored.with_defaults(&seeds))
                    .await?;
                info!(
                    event_hub = %self.config.event_hub,
                    partitions = seeds.len(),
                    batch_id = batch_id + 1,
                    "Seeded newly configured partitions"
                );
            }
            Some(batch_id) => {
                info!(
                    event_hub = %self.config.event_hub,
                    batch_id,
                    "Restored progress from checkpoint ledger"
                );
            }
        }
        Ok(self.current_progress())
    }

    /// Last processed sequence number implied by starting to read at `position`.
    async fn seed_progress(
        &self,
        partition: &PartitionKey,
        position: &EventPosition,
    ) -> Result<SequenceNumber> {
        let resolved = position.resolve()?;
        if let Some(progress) = resolved.local_progress() {
            return Ok(progress);
        }
        let first = self
            .client
            .first_sequence_number(partition, &resolved)
            .await?;
        Ok(first - 1)
    }

    /// Plans the next batch. Returns the outstanding plan again if the previous one was neither
    /// committed nor abandoned, and `None` when no partition has new events.
    pub async fn get_offset(&self) -> Result<Option<BatchPlan>> {
        if let Some(plan) = self.coordinator.outstanding() {
            debug!(batch_id = plan.batch_id(), "Reusing outstanding batch plan");
            return Ok(Some(plan));
        }
        let last_committed = self.ledger.last_committed_batch_id().ok_or_else(|| {
            Error::InvalidArgument("the source must be started before planning".to_string())
        })?;

        let current = self.planning_progress();
        let latest = self.fetch_latest(&current).await;
        let plan = match self.planner.plan(last_committed + 1, &current, &latest) {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                self.record_skipped_tick(SKIP_NO_NEW_EVENTS);
                return Ok(None);
            }
            Err(e @ Error::LatestPositionUnavailable(_)) => {
                self.record_skipped_tick(SKIP_LATEST_UNAVAILABLE);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.coordinator.track(plan.clone())?;
        connector_metrics()
            .planned_events_total
            .get_or_create(&event_hub_labels(&self.config.event_hub))
            .inc_by(plan.planned_events());
        debug!(
            batch_id = plan.batch_id(),
            events = plan.planned_events(),
            "Planned batch"
        );
        Ok(Some(plan))
    }

    /// Reads the records of `current`, each partition from the progress the plan was built from up
    /// to its target. `previous` only has to be an earlier plan; a partition it left partially
    /// delivered is read again from its committed progress.
    ///
    /// Either every partition is read or the call fails; calling it again with the same plans
    /// yields the same records.
    pub async fn get_batch(
        &self,
        previous: Option<&BatchPlan>,
        current: &BatchPlan,
    ) -> Result<RecordBatch> {
        if let Some(previous) = previous.filter(|p| p.batch_id() >= current.batch_id()) {
            return Err(Error::InvalidArgument(format!(
                "previous batch {} is not before batch {}",
                previous.batch_id(),
                current.batch_id()
            )));
        }

        let ranges: Vec<(PartitionKey, SequenceNumber, SequenceNumber)> = current
            .targets()
            .iter()
            .map(|(partition, target)| {
                let from_exclusive = current.start().get(partition).unwrap_or(NOTHING_PROCESSED);
                (partition.clone(), from_exclusive, target)
            })
            .collect();

        let records = stream::iter(ranges)
            .map(|(partition, from_exclusive, to_inclusive)| async move {
                let events = self
                    .fetch_range(&partition, from_exclusive, to_inclusive)
                    .await?;
                Ok::<_, Error>((partition, events))
            })
            .buffer_unordered(self.config.fetch_concurrency.max(1))
            .try_collect::<BTreeMap<_, _>>()
            .await?;

        Ok(RecordBatch {
            batch_id: current.batch_id(),
            records,
        })
    }

    async fn fetch_range(
        &self,
        partition: &PartitionKey,
        from_exclusive: SequenceNumber,
        to_inclusive: SequenceNumber,
    ) -> Result<Vec<EventData>> {
        if to_inclusive <= from_exclusive {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let events = self
            .client
            .fetch(partition, from_exclusive, to_inclusive)
            .await?;

        let labels = partition_labels(partition);
        let metrics = connector_metrics();
        metrics
            .fetch_time
            .get_or_create(&labels)
            .observe(start.elapsed().as_micros() as f64);
        metrics
            .fetched_events_total
            .get_or_create(&labels)
            .inc_by(events.len() as u64);
        Ok(events)
    }

    /// Commits every partition of `plan`. Must only be called after the records of the batch have
    /// been durably consumed.
    pub async fn commit(&self, plan: &BatchPlan) -> Result<()> {
        self.coordinator.commit_plan(plan).await
    }

    /// Drops the outstanding plan. The next [StreamSource::get_offset] plans from the last
    /// committed progress again.
    pub fn abandon(&self) -> Option<BatchPlan> {
        self.coordinator.abandon()
    }

    /// The listener the host engine reports completed batches to.
    pub fn listener(&self) -> Arc<CheckpointCoordinator<S>> {
        Arc::clone(&self.coordinator)
    }

    pub fn current_progress(&self) -> ProgressRecord {
        self.ledger.read_current()
    }

    pub fn last_committed_batch_id(&self) -> Option<BatchId> {
        self.ledger.last_committed_batch_id()
    }

    pub fn event_hub(&self) -> &str {
        &self.config.event_hub
    }

    /// Current progress of the configured partitions. Partitions that are only in the ledger are
    /// carried along by commits but never planned.
    fn planning_progress(&self) -> ProgressRecord {
        let configured = self.config.partitions();
        self.current_progress()
            .iter()
            .filter(|(partition, _)| configured.contains(partition))
            .map(|(partition, progress)| (partition.clone(), progress))
            .collect()
    }

    /// Newest sequence number of every partition in `current`. Partitions that could not be
    /// queried are left out, which makes the planner reject the tick.
    async fn fetch_latest(
        &self,
        current: &ProgressRecord,
    ) -> BTreeMap<PartitionKey, SequenceNumber> {
        stream::iter(current.partitions().cloned())
            .map(|partition| async move {
                let latest = self.client.latest_sequence_number(&partition).await;
                (partition, latest)
            })
            .buffer_unordered(self.config.fetch_concurrency.max(1))
            .filter_map(|(partition, latest)| async move {
                match latest {
                    Ok(latest) => Some((partition, latest)),
                    Err(e) => {
                        warn!(%partition, ?e, "Failed to fetch latest sequence number");
                        None
                    }
                }
            })
            .collect()
            .await
    }

    fn record_skipped_tick(&self, reason: &str) {
        connector_metrics()
            .skipped_ticks_total
            .get_or_create(&skipped_tick_labels(&self.config.event_hub, reason))
            .inc();
    }
}
