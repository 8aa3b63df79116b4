//! The forwarder stands in for the micro-batch engine. It runs one tick at a time: plan a batch,
//! read it, hand it to the sink and report it as completed, which commits it.
//!
//! ```text
//! get_offset --> get_batch --> (sink) --> on_batch_completed --> (ledger)
//! ```
//!
//! A tick that cannot plan or read is skipped and its plan abandoned, so the next tick starts over
//! from the committed progress. Ledger failures end the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::EventHubClient;
use crate::coordinator::BatchCompletionListener;
use crate::error::{Error, Result};
use crate::ledger::ArtifactStore;
use crate::source::{RecordBatch, StreamSource};

/// Destination of the batches read by the [Forwarder]. A batch counts as consumed once `deliver`
/// returns successfully.
#[trait_variant::make(BatchSink: Send)]
pub trait LocalBatchSink {
    async fn deliver(&self, batch: &RecordBatch) -> Result<()>;
}

pub struct Forwarder<C, S, K> {
    source: Arc<StreamSource<C, S>>,
    sink: K,
    tick_interval: Duration,
}

impl<C, S, K> Forwarder<C, S, K>
where
    C: EventHubClient + Sync,
    S: ArtifactStore + Sync,
    K: BatchSink + Sync,
{
    pub fn new(source: Arc<StreamSource<C, S>>, sink: K, tick_interval: Duration) -> Self {
        Self {
            source,
            sink,
            tick_interval,
        }
    }

    /// Runs ticks until `cln_token` is cancelled or a non-transient error occurs.
    pub async fn run(&self, cln_token: CancellationToken) -> Result<()> {
        info!(
            event_hub = %self.source.event_hub(),
            tick_interval = ?self.tick_interval,
            "Started forwarder"
        );
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = cln_token.cancelled() => break Ok(()),
                _ = ticker.tick() => {}
            }

            match self.tick(&cln_token).await {
                Ok(()) => {}
                Err(e @ Error::LatestPositionUnavailable(_)) => {
                    warn!(%e, "Skipping tick");
                }
                Err(e) if e.is_transient() => {
                    warn!(%e, "Batch failed, it will be planned again on the next tick");
                    self.source.abandon();
                }
                Err(e) => {
                    error!(%e, "Forwarder stopped");
                    break Err(e);
                }
            }
        };

        self.source.abandon();
        info!(event_hub = %self.source.event_hub(), "Stopped forwarder");
        result
    }

    async fn tick(&self, cln_token: &CancellationToken) -> Result<()> {
        let Some(plan) = self.source.get_offset().await? else {
            debug!("No new events");
            return Ok(());
        };
        let batch = self.source.get_batch(None, &plan).await?;
        if cln_token.is_cancelled() {
            return Ok(());
        }

        self.sink.deliver(&batch).await?;
        self.source
            .listener()
            .on_batch_completed(batch.batch_id, &batch.counts())
            .await?;
        info!(
            batch_id = batch.batch_id,
            records = batch.len(),
            "Forwarded batch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::client::test_utils::FaultyClient;
    use crate::ledger::{InMemoryArtifactStore, ProgressLedger};
    use crate::partition::{PartitionKey, SequenceNumber};
    use crate::planner::{BatchPlanner, RateLimits};
    use crate::position::EventPosition;
    use crate::progress::ProgressRecord;
    use crate::source::SourceConfig;

    /// Collects delivered batches and fails the first `failures` deliveries.
    #[derive(Clone, Default)]
    struct CollectingSink {
        batches: Arc<parking_lot::Mutex<Vec<RecordBatch>>>,
        failures: Arc<AtomicUsize>,
    }

    impl BatchSink for CollectingSink {
        async fn deliver(&self, batch: &RecordBatch) -> Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::Sink("sink unavailable".to_string()));
            }
            self.batches.lock().push(batch.clone());
            Ok(())
        }
    }

    fn record(values: &[(u32, SequenceNumber)]) -> ProgressRecord {
        values
            .iter()
            .map(|(p, s)| (PartitionKey::new("hub", *p), *s))
            .collect()
    }

    async fn started_source(
        client: FaultyClient,
        store: InMemoryArtifactStore,
        max_events: u64,
    ) -> Arc<StreamSource<FaultyClient, InMemoryArtifactStore>> {
        let ledger = Arc::new(ProgressLedger::open(store).await.unwrap());
        let source = StreamSource::new(
            SourceConfig::new("hub", 2),
            BatchPlanner::new(RateLimits::new(max_events)),
            client,
            ledger,
        );
        source
            .start(&EventPosition::from_start_of_stream())
            .await
            .unwrap();
        Arc::new(source)
    }

    async fn wait_for_progress(
        source: &StreamSource<FaultyClient, InMemoryArtifactStore>,
        expected: &ProgressRecord,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while &source.current_progress() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("progress was not reached in time");
    }

    #[tokio::test]
    async fn test_forwards_until_cancelled() {
        let client = FaultyClient::with_events(2, 5);
        let source = started_source(client, InMemoryArtifactStore::new(), 2).await;
        let sink = CollectingSink::default();
        let forwarder = Forwarder::new(
            Arc::clone(&source),
            sink.clone(),
            Duration::from_millis(5),
        );

        let cln_token = CancellationToken::new();
        let handle = tokio::spawn({
            let cln_token = cln_token.clone();
            async move { forwarder.run(cln_token).await }
        });

        wait_for_progress(&source, &record(&[(0, 4), (1, 4)])).await;
        cln_token.cancel();
        handle.await.unwrap().unwrap();

        let batches = sink.batches.lock();
        let delivered: usize = batches.iter().map(RecordBatch::len).sum();
        assert_eq!(delivered, 10);
        let batch_ids: Vec<_> = batches.iter().map(|b| b.batch_id).collect();
        assert_eq!(batch_ids, vec![0, 1, 2]);
        assert!(source.listener().outstanding().is_none());
    }

    #[tokio::test]
    async fn test_sink_failure_redelivers_batch() {
        let client = FaultyClient::with_events(2, 3);
        let source = started_source(client, InMemoryArtifactStore::new(), 10).await;
        let sink = CollectingSink {
            failures: Arc::new(AtomicUsize::new(2)),
            ..Default::default()
        };
        let forwarder = Forwarder::new(
            Arc::clone(&source),
            sink.clone(),
            Duration::from_millis(5),
        );

        let cln_token = CancellationToken::new();
        let handle = tokio::spawn({
            let cln_token = cln_token.clone();
            async move { forwarder.run(cln_token).await }
        });

        wait_for_progress(&source, &record(&[(0, 2), (1, 2)])).await;
        cln_token.cancel();
        handle.await.unwrap().unwrap();

        let batches = sink.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].batch_id, 0);
        assert_eq!(
            batches[0].counts(),
            BTreeMap::from([
                (PartitionKey::new("hub", 0), 3),
                (PartitionKey::new("hub", 1), 3)
            ])
        );
    }

    #[tokio::test]
    async fn test_fetch_failure_is_retried() {
        let client = FaultyClient::with_events(2, 3);
        client.fail_fetch(0, true);
        let source = started_source(client.clone(), InMemoryArtifactStore::new(), 10).await;
        let sink = CollectingSink::default();
        let forwarder = Forwarder::new(
            Arc::clone(&source),
            sink.clone(),
            Duration::from_millis(5),
        );

        let cln_token = CancellationToken::new();
        let handle = tokio::spawn({
            let cln_token = cln_token.clone();
            async move { forwarder.run(cln_token).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.fetch_calls() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(sink.batches.lock().is_empty());
        assert_eq!(source.last_committed_batch_id(), Some(-1));

        client.fail_fetch(0, false);
        wait_for_progress(&source, &record(&[(0, 2), (1, 2)])).await;
        cln_token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(source.last_committed_batch_id(), Some(0));
    }

    #[tokio::test]
    async fn test_ledger_failure_stops_forwarder() {
        let store = InMemoryArtifactStore::new();
        let client = FaultyClient::with_events(2, 3);
        let source = started_source(client, store.clone(), 10).await;
        store.set_fail_publish(true);

        let sink = CollectingSink::default();
        let forwarder = Forwarder::new(
            Arc::clone(&source),
            sink.clone(),
            Duration::from_millis(5),
        );
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            forwarder.run(CancellationToken::new()),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(Error::CheckpointWrite(_))));
        // the batch was delivered but never committed, it will be read again after a restart
        assert_eq!(sink.batches.lock().len(), 1);
        assert_eq!(source.current_progress(), record(&[(0, -1), (1, -1)]));
        assert!(source.listener().outstanding().is_none());
    }
}
