pub mod analytics;
pub mod crawl;
pub mod reconcile;

pub use analytics::analytics;
pub use crawl::crawl;
pub use reconcile::reconcile;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;

use raidcrawl::config::Config;
use raidcrawl::crawler::{ReportFetcher, ReportPipeline, ThrottleGate};
use raidcrawl::metrics;
use raidcrawl::notifications::Alerter;
use raidcrawl::queue::{Broker, RedisBroker};
use raidcrawl::storage::{ActivityStore, ActivityWriter, PgStore};

/// Shutdown flag raised on Ctrl-C
///
/// The sender is returned so a command can also stop itself.
pub fn shutdown_channel() -> (Arc<watch::Sender<bool>>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);

    let signal = Arc::clone(&tx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, shutting down");
            let _ = signal.send(true);
        }
    });

    (tx, rx)
}

/// Start the metrics endpoint when enabled
pub fn start_metrics(config: &Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    if !config.metrics.enabled {
        return Ok(());
    }

    metrics::init_metrics().map_err(|e| anyhow::anyhow!("Failed to register metrics: {e}"))?;
    let port = config.metrics.port;
    tokio::spawn(async move {
        if let Err(e) = metrics::server::serve(port, shutdown).await {
            tracing::error!(error = %e, "Metrics server stopped");
        }
    });
    Ok(())
}

pub fn build_alerter(config: &Config) -> Result<Arc<Alerter>> {
    let alerter = Alerter::from_config(&config.alerts).context("Failed to set up alerting")?;
    Ok(Arc::new(alerter))
}

/// Connect the stores and the upstream client into one attempt pipeline
pub async fn build_pipeline(config: &Config, alerter: &Arc<Alerter>) -> Result<Arc<ReportPipeline>> {
    let store = PgStore::connect(&config.database)?;
    store
        .ensure_schema()
        .await
        .context("Failed to prepare primary store schema")?;
    let store: Arc<dyn ActivityStore> = Arc::new(store);

    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&config.broker).await?);
    let writer = Arc::new(ActivityWriter::new(
        store,
        broker,
        config.database.commit_retries,
    ));

    let fetcher = ReportFetcher::new(&config.api, Arc::new(ThrottleGate::new()))
        .context("Failed to create report fetcher")?;

    Ok(Arc::new(
        ReportPipeline::new(Arc::new(fetcher), writer, config.freshness)
            .with_alerter(Arc::clone(alerter)),
    ))
}
