use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::sync::Arc;

use raidcrawl::config::Config;
use raidcrawl::crawler::Offloader;
use raidcrawl::models::InstanceId;
use raidcrawl::notifications::AlertKind;
use raidcrawl::storage::MissedLog;

use super::{build_alerter, build_pipeline, shutdown_channel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    AlreadyStored,
    Found,
    Failed,
}

/// Retry every id in the recovery log once more
///
/// Ids that fail again are appended to the fresh log by the offload path;
/// the rotated copy is deleted at the end of the pass.
pub async fn reconcile(config: Config) -> Result<()> {
    config.validate()?;
    let (_stop, shutdown) = shutdown_channel();

    let alerter = build_alerter(&config)?;
    let pipeline = build_pipeline(&config, &alerter).await?;
    let missed = Arc::new(MissedLog::new(config.recovery.missed_log_path.clone()));

    let ids = missed
        .rotate()
        .await
        .with_context(|| format!("Failed to rotate {}", missed.path().display()))?;
    let total = ids.len();
    tracing::info!(total = total, path = %missed.path().display(), "Reconciling missed instances");

    let offloader = Arc::new(Offloader::new(
        &config.offload,
        Arc::clone(&pipeline),
        Arc::clone(&missed),
        Arc::clone(&alerter),
        shutdown.clone(),
    ));
    let store = Arc::clone(pipeline.writer().store());

    let results: Vec<Settled> = stream::iter(ids)
        .map(|instance_id: InstanceId| {
            let offloader = Arc::clone(&offloader);
            let store = Arc::clone(&store);
            let missed = Arc::clone(&missed);
            let shutdown = shutdown.clone();
            async move {
                if *shutdown.borrow() {
                    // Keep it for the next pass
                    if let Err(e) = missed.append(instance_id).await {
                        tracing::error!(instance_id = instance_id, error = %e, "Failed to write missed log");
                    }
                    return Settled::Failed;
                }
                match store.is_stored(instance_id).await {
                    Ok(true) => return Settled::AlreadyStored,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(instance_id = instance_id, error = %e, "Stored check failed, retrying anyway"),
                }
                if offloader.retry(instance_id).await {
                    Settled::Found
                } else {
                    Settled::Failed
                }
            }
        })
        .buffer_unordered(config.recovery.reconcile_workers.max(1))
        .collect()
        .await;

    let found = results.iter().filter(|s| **s != Settled::Failed).count();
    let failed = total - found;

    missed
        .discard_rotated()
        .await
        .context("Failed to remove rotated missed log")?;

    tracing::info!(
        total = total,
        found = found,
        already_stored = results.iter().filter(|s| **s == Settled::AlreadyStored).count(),
        failed = failed,
        "Reconcile pass finished"
    );
    alerter
        .send(AlertKind::ReconcileSummary {
            total,
            found,
            failed,
        })
        .await;

    Ok(())
}
