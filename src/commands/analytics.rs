use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use raidcrawl::analytics::{Batcher, ClickHouseSink, Sink};
use raidcrawl::config::Config;
use raidcrawl::queue::{Broker, RedisBroker};

use super::{shutdown_channel, start_metrics};

/// Move normalized activities from the broker into ClickHouse until
/// Ctrl-C or the broker closes
pub async fn analytics(config: Config) -> Result<()> {
    config.validate()?;
    let (_stop, shutdown) = shutdown_channel();
    start_metrics(&config, shutdown.clone())?;

    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&config.broker).await?);
    let sink: Arc<dyn Sink> =
        Arc::new(ClickHouseSink::new(&config.analytics).context("Failed to create ClickHouse sink")?);

    tracing::info!(
        table = %config.analytics.table,
        batch_size = config.analytics.batch_size,
        window_secs = config.analytics.batch_window_secs,
        "Starting analytics consumer"
    );

    let batcher = Batcher::new(
        broker,
        sink,
        config.analytics.batch_size,
        config.batch_window(),
        Duration::from_secs(config.broker.consume_timeout_secs.max(1)),
    );
    let stats = batcher.run(shutdown).await;

    tracing::info!(
        restored = stats.restored,
        inserted = stats.inserted,
        requeued = stats.requeued,
        dropped = stats.dropped,
        flushes = stats.flushes,
        failed_flushes = stats.failed_flushes,
        "Analytics consumer stopped"
    );
    Ok(())
}
