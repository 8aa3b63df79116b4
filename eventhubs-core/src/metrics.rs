use std::iter;
use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::error::{Error, Result};
use crate::partition::PartitionKey;

// The top-level metric registry is created with the GLOBAL_PREFIX
const REGISTRY_GLOBAL_PREFIX: &str = "eventhubs";

const EVENT_HUB_LABEL: &str = "event_hub";
const PARTITION_LABEL: &str = "partition";
const REASON_LABEL: &str = "reason";

// Note: We do not add a suffix to the metric name, as the suffix is inferred through the metric type
// by the prometheus client library
const COMMITTED_SEQUENCE_NUMBER: &str = "committed_sequence_number";
const COMMITTED_BATCH: &str = "committed_batch";
const COMMITS_TOTAL: &str = "commits";
const STALE_COMMITS_TOTAL: &str = "stale_commits";
const PLANNED_EVENTS_TOTAL: &str = "planned_events";
const SKIPPED_TICKS_TOTAL: &str = "skipped_ticks";
const FETCHED_EVENTS_TOTAL: &str = "fetched_events";
const FETCH_TIME: &str = "fetch_time";

pub(crate) type Labels = Vec<(String, String)>;

/// The global register of all metrics.
#[derive(Default)]
struct GlobalRegistry {
    // It is okay to use a blocking mutex because we register each metric only one time.
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::default)
}

/// Metrics of the checkpointing core. Each metric is a family differentiated by its labels.
pub(crate) struct ConnectorMetrics {
    // gauges
    pub(crate) committed_sequence_number: Family<Labels, Gauge>,
    pub(crate) committed_batch: Gauge,

    // counters
    pub(crate) commits_total: Counter,
    pub(crate) stale_commits_total: Counter,
    pub(crate) planned_events_total: Family<Labels, Counter>,
    pub(crate) skipped_ticks_total: Family<Labels, Counter>,
    pub(crate) fetched_events_total: Family<Labels, Counter>,

    // timers
    pub(crate) fetch_time: Family<Labels, Histogram>,
}

/// Exponential bucket distribution with range.
/// Creates `length` buckets, where the lowest bucket is `min` and the highest bucket is `max`.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    let growth_factor = (max / min).powf(1.0 / (f64::from(length) - 1.0));
    iter::repeat(())
        .enumerate()
        .map(move |(i, _)| min * growth_factor.powf(i as f64))
        .take(length.into())
}

impl ConnectorMetrics {
    fn new() -> Self {
        let metrics = Self {
            committed_sequence_number: Family::<Labels, Gauge>::default(),
            committed_batch: Gauge::default(),
            commits_total: Counter::default(),
            stale_commits_total: Counter::default(),
            planned_events_total: Family::<Labels, Counter>::default(),
            skipped_ticks_total: Family::<Labels, Counter>::default(),
            fetched_events_total: Family::<Labels, Counter>::default(),
            // exponential buckets in the range 100 microseconds to 15 minutes
            fetch_time: Family::<Labels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets_range(100.0, 60000000.0 * 15.0, 10))
            }),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_GLOBAL_PREFIX);
        registry.register(
            COMMITTED_SEQUENCE_NUMBER,
            "A Gauge to keep track of the last committed sequence number of every partition",
            metrics.committed_sequence_number.clone(),
        );
        registry.register(
            COMMITTED_BATCH,
            "A Gauge to keep track of the last committed batch id",
            metrics.committed_batch.clone(),
        );
        registry.register(
            COMMITS_TOTAL,
            "A Counter to keep track of the total number of successful ledger commits",
            metrics.commits_total.clone(),
        );
        registry.register(
            STALE_COMMITS_TOTAL,
            "A Counter to keep track of the total number of rejected out-of-order commits",
            metrics.stale_commits_total.clone(),
        );
        registry.register(
            PLANNED_EVENTS_TOTAL,
            "A Counter to keep track of the total number of events covered by batch plans",
            metrics.planned_events_total.clone(),
        );
        registry.register(
            SKIPPED_TICKS_TOTAL,
            "A Counter to keep track of the ticks that produced no batch, by reason",
            metrics.skipped_ticks_total.clone(),
        );
        registry.register(
            FETCHED_EVENTS_TOTAL,
            "A Counter to keep track of the total number of events fetched from the event hub",
            metrics.fetched_events_total.clone(),
        );
        registry.register(
            FETCH_TIME,
            "A Histogram to keep track of the time taken to fetch a partition range in microseconds",
            metrics.fetch_time.clone(),
        );
        metrics
    }
}

static CONNECTOR_METRICS: OnceLock<ConnectorMetrics> = OnceLock::new();

pub(crate) fn connector_metrics() -> &'static ConnectorMetrics {
    CONNECTOR_METRICS.get_or_init(ConnectorMetrics::new)
}

pub(crate) fn partition_labels(partition: &PartitionKey) -> Labels {
    vec![
        (EVENT_HUB_LABEL.to_string(), partition.name.clone()),
        (PARTITION_LABEL.to_string(), partition.partition.to_string()),
    ]
}

pub(crate) fn event_hub_labels(event_hub: &str) -> Labels {
    vec![(EVENT_HUB_LABEL.to_string(), event_hub.to_string())]
}

pub(crate) fn skipped_tick_labels(event_hub: &str, reason: &str) -> Labels {
    vec![
        (EVENT_HUB_LABEL.to_string(), event_hub.to_string()),
        (REASON_LABEL.to_string(), reason.to_string()),
    ]
}

/// Renders every registered metric in the OpenMetrics text format.
pub fn export_metrics() -> Result<String> {
    // make sure the connector metrics are registered even if nothing has been recorded yet
    let _ = connector_metrics();
    let mut buffer = String::new();
    let registry = global_registry().registry.lock();
    encode(&mut buffer, &registry).map_err(|e| Error::Metrics(e.to_string()))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_registered_metrics() {
        connector_metrics()
            .committed_sequence_number
            .get_or_create(&partition_labels(&PartitionKey::new("metrics-hub", 1)))
            .set(42);

        let exported = export_metrics().unwrap();
        assert!(exported.contains("eventhubs_committed_sequence_number"));
        assert!(exported.contains("event_hub=\"metrics-hub\""));
        assert!(exported.contains("eventhubs_commits_total"));
    }

    #[test]
    fn test_exponential_buckets() {
        let buckets: Vec<f64> = exponential_buckets_range(1.0, 100.0, 3).collect();
        assert_eq!(buckets.len(), 3);
        assert!((buckets[1] - 10.0).abs() < 1e-9);
    }
}
