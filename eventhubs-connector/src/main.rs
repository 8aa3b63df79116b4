use std::error::Error;
use std::sync::Arc;

use eventhubs_core::client::generator::GeneratorClient;
use eventhubs_core::config::Settings;
use eventhubs_core::forwarder::{BatchSink, Forwarder};
use eventhubs_core::ledger::FsArtifactStore;
use eventhubs_core::metrics::export_metrics;
use eventhubs_core::{BatchPlanner, ProgressLedger, RecordBatch, StreamSource};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = Settings::load()?;
    info!(
        event_hub = %settings.event_hub,
        partitions = settings.partition_count,
        checkpoint_path = %settings.checkpoint_path.display(),
        "Starting connector"
    );

    let store = FsArtifactStore::new(settings.checkpoint_path.clone()).await?;
    let ledger = Arc::new(ProgressLedger::open(store).await?);
    let client = GeneratorClient::new(settings.event_hub.clone(), settings.partition_count);
    let source = Arc::new(StreamSource::new(
        settings.source_config(),
        BatchPlanner::new(settings.rate_limits()),
        client.clone(),
        ledger,
    ));
    let progress = source.start(&settings.starting_position).await?;
    info!(
        partitions = progress.len(),
        batch_id = ?source.last_committed_batch_id(),
        "Source started"
    );

    let cln_token = CancellationToken::new();
    let generator = tokio::spawn({
        let cln_token = cln_token.clone();
        let config = settings.generator.clone();
        async move { client.run(config, cln_token).await }
    });
    let shutdown = tokio::spawn({
        let cln_token = cln_token.clone();
        async move {
            shutdown_signal().await;
            cln_token.cancel();
        }
    });

    let forwarder = Forwarder::new(source, LogSink, settings.tick_interval);
    let result = forwarder.run(cln_token.clone()).await;

    cln_token.cancel();
    generator.await?;
    shutdown.abort();

    match export_metrics() {
        Ok(metrics) => debug!(%metrics, "Final metrics"),
        Err(e) => error!(?e, "Failed to export metrics"),
    }
    result?;
    Ok(())
}

/// Writes every record of a batch to the log.
struct LogSink;

impl BatchSink for LogSink {
    async fn deliver(&self, batch: &RecordBatch) -> eventhubs_core::Result<()> {
        for events in batch.records.values() {
            for event in events {
                info!(
                    batch_id = batch.batch_id,
                    partition = %event.partition,
                    sequence_number = event.sequence_number,
                    offset = %event.offset,
                    enqueued_time = %event.enqueued_time,
                    payload = %String::from_utf8_lossy(&event.body),
                    "Delivered event"
                );
            }
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
