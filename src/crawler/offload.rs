//! Offload lane
//!
//! Ids the live workers gave up on get a slower second chance here, one task
//! per id, so a stubborn id never holds up a worker generation. An id that
//! still cannot be settled goes to the recovery log.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use super::gap::GapEvent;
use super::pipeline::ReportPipeline;
use super::sleep_unless_shutdown;
use crate::config::OffloadConfig;
use crate::models::InstanceId;
use crate::notifications::{AlertKind, Alerter};
use crate::report::classify::Outcome;
use crate::storage::MissedLog;

/// Patient per-id retrier
pub struct Offloader {
    config: OffloadConfig,
    pipeline: Arc<ReportPipeline>,
    missed: Arc<MissedLog>,
    alerter: Arc<Alerter>,
    /// Gap monitor; absent outside a crawl
    gap_events: Option<mpsc::Sender<GapEvent>>,
    shutdown: watch::Receiver<bool>,
}

impl Offloader {
    pub fn new(
        config: &OffloadConfig,
        pipeline: Arc<ReportPipeline>,
        missed: Arc<MissedLog>,
        alerter: Arc<Alerter>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config: config.clone(),
            pipeline,
            missed,
            alerter,
            gap_events: None,
            shutdown,
        }
    }

    /// Report exhausted ids to the gap monitor
    pub fn with_gap_events(mut self, gap_events: mpsc::Sender<GapEvent>) -> Self {
        self.gap_events = Some(gap_events);
        self
    }

    /// Delay before attempt `attempt + 1`
    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.config.backoff_unit_secs * u64::from(attempt) * u64::from(attempt))
    }

    /// Retry one id; true once it is settled
    ///
    /// Upstream-disabled responses pause without using an attempt. On
    /// exhaustion, a restricted or unwritable report, or shutdown, the id is
    /// appended to the recovery log. Unwritable reports are not reported to
    /// the gap monitor.
    pub async fn retry(&self, instance_id: InstanceId) -> bool {
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 1;
        let mut last = Outcome::Transient;

        while attempt <= self.config.max_attempts {
            let result = self.pipeline.attempt(instance_id, attempt - 1).await;
            last = result.outcome;

            let pause = match result.outcome {
                outcome if outcome.is_found() => return true,
                Outcome::AccessRestricted | Outcome::Unwritable => break,
                Outcome::UpstreamDisabled => Duration::from_secs(self.config.disabled_cooldown_secs),
                _ => {
                    if attempt == self.config.warn_attempt {
                        self.alerter.notify(AlertKind::OffloadWarning {
                            instance_id,
                            attempt,
                        });
                    }
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    delay
                }
            };

            if attempt > self.config.max_attempts
                || !sleep_unless_shutdown(pause, &mut shutdown).await
            {
                break;
            }
        }

        tracing::warn!(
            instance_id = instance_id,
            outcome = %last,
            attempts = attempt.min(self.config.max_attempts),
            "Giving up on instance"
        );
        if let Err(e) = self.missed.append(instance_id).await {
            tracing::error!(instance_id = instance_id, error = %e, "Failed to write missed log");
        }
        if last == Outcome::Unwritable {
            return false;
        }
        if let Some(events) = &self.gap_events {
            let _ = events.send(GapEvent::Miss(instance_id)).await;
        }
        if last == Outcome::AccessRestricted {
            self.alerter.notify(AlertKind::AccessRestricted { instance_id });
        } else {
            self.alerter.notify(AlertKind::PermanentMiss {
                instance_id,
                gap: false,
            });
        }
        false
    }

    /// Spawn one retry task per received id until the channel closes,
    /// then wait for every task
    pub async fn run(self: Arc<Self>, mut ids: mpsc::Receiver<InstanceId>) {
        let mut tasks = JoinSet::new();

        while let Some(instance_id) = ids.recv().await {
            let offloader = Arc::clone(&self);
            tasks.spawn(async move { offloader.retry(instance_id).await });
            while tasks.try_join_next().is_some() {}
        }

        while tasks.join_next().await.is_some() {}
    }
}
