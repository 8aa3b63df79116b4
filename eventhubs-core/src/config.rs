use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use serde::Deserialize;

use crate::client::generator::GeneratorConfig;
use crate::error::{Error, Result};
use crate::partition::PartitionKey;
use crate::planner::RateLimits;
use crate::position::EventPosition;
use crate::source::SourceConfig;

/// Base64 encoded JSON settings of the connector.
pub const ENV_CONNECTOR_CONFIG: &str = "EVENTHUBS_CONNECTOR_CONFIG";

const DEFAULT_CHECKPOINT_PATH: &str = "checkpoints";
const DEFAULT_MAX_EVENTS_PER_PARTITION: u64 = 1000;
const DEFAULT_FETCH_CONCURRENCY: usize = 8;
const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
const DEFAULT_MIN_BATCHES_TO_RETAIN: usize = 100;

/// Settings as they appear in the encoded JSON. Everything but the event hub is optional.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SettingsSpec {
    event_hub: String,
    partition_count: u32,
    checkpoint_path: Option<PathBuf>,
    starting_position: Option<EventPosition>,
    #[serde(default)]
    starting_positions: HashMap<u32, EventPosition>,
    max_events_per_partition: Option<u64>,
    #[serde(default)]
    max_events_per_partition_overrides: HashMap<u32, u64>,
    fetch_concurrency: Option<usize>,
    tick_interval_ms: Option<u64>,
    min_batches_to_retain: Option<usize>,
    generator: Option<GeneratorSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GeneratorSpec {
    rpu: Option<usize>,
    duration_ms: Option<u64>,
    /// Base64 encoded payload of every generated event.
    value_blob: Option<String>,
    msg_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub event_hub: String,
    pub partition_count: u32,
    /// Directory the checkpoint ledger is written to.
    pub checkpoint_path: PathBuf,
    pub starting_position: EventPosition,
    pub starting_positions: HashMap<u32, EventPosition>,
    pub max_events_per_partition: u64,
    pub max_events_per_partition_overrides: HashMap<u32, u64>,
    pub fetch_concurrency: usize,
    pub tick_interval: Duration,
    /// `None` keeps every ledger entry.
    pub min_batches_to_retain: Option<usize>,
    pub generator: GeneratorConfig,
}

impl Settings {
    /// Loads the settings from [ENV_CONNECTOR_CONFIG].
    pub fn load() -> Result<Self> {
        let encoded = env::var(ENV_CONNECTOR_CONFIG)
            .map_err(|e| Error::Config(format!("{ENV_CONNECTOR_CONFIG} is not set: {e}")))?;
        Self::from_encoded(&encoded)
    }

    pub fn from_encoded(encoded: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| Error::Config(format!("Failed to decode connector settings: {e:?}")))?;
        let spec: SettingsSpec = serde_json::from_slice(&decoded)
            .map_err(|e| Error::Config(format!("Failed to parse connector settings: {e}")))?;
        Self::try_from(spec)
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            event_hub: self.event_hub.clone(),
            partition_count: self.partition_count,
            starting_positions: self.starting_positions.clone(),
            fetch_concurrency: self.fetch_concurrency,
            min_batches_to_retain: self.min_batches_to_retain,
        }
    }

    pub fn rate_limits(&self) -> RateLimits {
        self.max_events_per_partition_overrides.iter().fold(
            RateLimits::new(self.max_events_per_partition),
            |limits, (partition, max_events)| {
                limits.with_override(
                    PartitionKey::new(self.event_hub.clone(), *partition),
                    *max_events,
                )
            },
        )
    }

    fn validate(&self) -> Result<()> {
        if self.event_hub.is_empty() {
            return Err(Error::Config("eventHub must not be empty".to_string()));
        }
        if self.partition_count == 0 {
            return Err(Error::Config("partitionCount must be at least 1".to_string()));
        }
        if self.fetch_concurrency == 0 {
            return Err(Error::Config("fetchConcurrency must be at least 1".to_string()));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::Config("tickIntervalMs must be at least 1".to_string()));
        }
        if self.max_events_per_partition == 0 {
            return Err(Error::Config(
                "maxEventsPerPartition must be at least 1".to_string(),
            ));
        }
        for (partition, max_events) in &self.max_events_per_partition_overrides {
            if *max_events == 0 {
                return Err(Error::Config(format!(
                    "maxEventsPerPartitionOverrides of partition {partition} must be at least 1"
                )));
            }
        }

        let out_of_range = self
            .starting_positions
            .keys()
            .chain(self.max_events_per_partition_overrides.keys())
            .find(|partition| **partition >= self.partition_count);
        if let Some(partition) = out_of_range {
            return Err(Error::Config(format!(
                "partition {partition} is configured but the event hub has {} partitions",
                self.partition_count
            )));
        }
        Ok(())
    }
}

impl TryFrom<SettingsSpec> for Settings {
    type Error = Error;

    fn try_from(spec: SettingsSpec) -> Result<Self> {
        let generator = match spec.generator {
            Some(generator) => generator.try_into()?,
            None => GeneratorConfig::default(),
        };
        let settings = Settings {
            event_hub: spec.event_hub,
            partition_count: spec.partition_count,
            checkpoint_path: spec
                .checkpoint_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_PATH)),
            starting_position: spec
                .starting_position
                .unwrap_or_else(EventPosition::from_start_of_stream),
            starting_positions: spec.starting_positions,
            max_events_per_partition: spec
                .max_events_per_partition
                .unwrap_or(DEFAULT_MAX_EVENTS_PER_PARTITION),
            max_events_per_partition_overrides: spec.max_events_per_partition_overrides,
            fetch_concurrency: spec.fetch_concurrency.unwrap_or(DEFAULT_FETCH_CONCURRENCY),
            tick_interval: Duration::from_millis(
                spec.tick_interval_ms.unwrap_or(DEFAULT_TICK_INTERVAL_MS),
            ),
            // zero disables purging
            min_batches_to_retain: Some(
                spec.min_batches_to_retain
                    .unwrap_or(DEFAULT_MIN_BATCHES_TO_RETAIN),
            )
            .filter(|retain| *retain > 0),
            generator,
        };
        settings.validate()?;
        Ok(settings)
    }
}

impl TryFrom<GeneratorSpec> for GeneratorConfig {
    type Error = Error;

    fn try_from(spec: GeneratorSpec) -> Result<Self> {
        let mut config = GeneratorConfig::default();
        if let Some(rpu) = spec.rpu {
            config.rpu = rpu;
        }
        if let Some(duration_ms) = spec.duration_ms {
            if duration_ms == 0 {
                return Err(Error::Config(
                    "generator durationMs must be at least 1".to_string(),
                ));
            }
            config.duration = Duration::from_millis(duration_ms);
        }
        if let Some(value_blob) = &spec.value_blob {
            let value_blob = BASE64_STANDARD.decode(value_blob.as_bytes()).map_err(|e| {
                Error::Config(format!(
                    "Failed to base64 decode generator value blob: {e:?}"
                ))
            })?;
            config.content = Bytes::from(value_blob);
        }
        if let Some(msg_size) = spec.msg_size {
            config.msg_size_bytes = msg_size;
        }
        Ok(config)
    }
}
