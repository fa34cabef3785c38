use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

use raidcrawl::config::Config;
use raidcrawl::crawler::{CrawlController, GapMonitor, ModeState, Offloader, WorkerContext};
use raidcrawl::error::CrawlErrorTrait;
use raidcrawl::models::InstanceId;
use raidcrawl::notifications::AlertKind;
use raidcrawl::storage::{MissedLog, INSTANCE_ID_CEILING};

use super::{build_alerter, build_pipeline, shutdown_channel, start_metrics};

/// Capacity of the channel feeding the gap monitor
const GAP_EVENT_CAPACITY: usize = 1_024;

/// Crawl forward from `start` (or the stored high-water mark minus the
/// configured buffer) until Ctrl-C or a fatal gap-mode abort
pub async fn crawl(config: Config, start: Option<InstanceId>) -> Result<()> {
    config.validate()?;
    let (stop, shutdown) = shutdown_channel();
    start_metrics(&config, shutdown.clone())?;

    let alerter = build_alerter(&config)?;
    let pipeline = build_pipeline(&config, &alerter).await?;

    let first = match start {
        Some(id) => id,
        None => {
            let latest = pipeline
                .writer()
                .store()
                .latest_instance_id(INSTANCE_ID_CEILING)
                .await
                .context("Failed to read the latest stored instance")?
                .context("No stored activities to resume from; pass --start")?;
            latest - config.crawler.start_buffer
        }
    };
    let cursor = first - 1;

    tracing::info!(
        start = first,
        workers = config.crawler.start_workers,
        "Starting crawl"
    );
    alerter.send(AlertKind::Startup { cursor: first }).await;

    let missed = Arc::new(MissedLog::new(config.recovery.missed_log_path.clone()));
    let mode = ModeState::new();
    let (gap_tx, gap_rx) = mpsc::channel(GAP_EVENT_CAPACITY);
    let (escalation_tx, escalation_rx) = mpsc::channel(config.offload.queue_capacity.max(1));

    let offloader = Arc::new(
        Offloader::new(
            &config.offload,
            Arc::clone(&pipeline),
            Arc::clone(&missed),
            Arc::clone(&alerter),
            shutdown.clone(),
        )
        .with_gap_events(gap_tx.clone()),
    );
    let offload_task = tokio::spawn(offloader.run(escalation_rx));

    let monitor = GapMonitor::new(&config.gap, Arc::clone(&mode));
    let mut monitor_task = tokio::spawn(monitor.run(gap_rx, Arc::clone(&alerter)));

    let ctx = WorkerContext {
        pipeline: Arc::clone(&pipeline),
        escalations: escalation_tx,
        gap_events: gap_tx,
        missed,
        alerter: Arc::clone(&alerter),
        shutdown,
    };
    let mut controller = CrawlController::new(&config.crawler, &config.gap, ctx, mode, cursor);
    let mut controller_task = tokio::spawn(async move {
        controller.run().await;
        controller.cursor()
    });

    // Every sender of the offload and gap channels lives in the controller's
    // workers, so both tasks finish once the controller does.
    tokio::select! {
        joined = &mut monitor_task => {
            let reason = match joined {
                Ok(Ok(())) => String::from("gap monitor stopped unexpectedly"),
                Ok(Err(e)) => {
                    tracing::error!(category = e.category().as_str(), error = %e, "Gap monitor aborted");
                    e.to_string()
                }
                Err(e) => format!("gap monitor task failed: {e}"),
            };
            tracing::error!(reason = %reason, "Fatal: stopping crawl");
            let _ = stop.send(true);
            alerter.send(AlertKind::Fatal { reason: reason.clone() }).await;

            if let Ok(cursor) = controller_task.await {
                tracing::info!(cursor = cursor, "Controller stopped");
            }
            let _ = offload_task.await;
            anyhow::bail!(reason);
        }
        joined = &mut controller_task => {
            let cursor = joined.context("Crawl controller task failed")?;
            offload_task.await.context("Offload task failed")?;
            monitor_task
                .await
                .context("Gap monitor task failed")?
                .context("Gap monitor aborted")?;

            let stats = pipeline.stats().snapshot();
            tracing::info!(
                cursor = cursor,
                attempts = stats.attempts,
                stored = stats.stored,
                duplicates = stats.duplicates,
                not_found = stats.not_found,
                transient = stats.transient,
                unwritable = stats.unwritable,
                "Crawl stopped"
            );
        }
    }

    Ok(())
}
