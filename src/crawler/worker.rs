//! Fetch workers
//!
//! A worker pulls ids from a queue shared by its generation and drives each
//! one through the retry policy until it is settled, escalated or missed.
//! Live and gap workers share the loop; they differ only in their policy and
//! in where a settled or missed id is reported.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

use super::gap::GapEvent;
use super::lag::LagWindow;
use super::pipeline::ReportPipeline;
use super::policy::{Action, AttemptState, RetryPolicy};
use super::sleep_unless_shutdown;
use crate::models::InstanceId;
use crate::notifications::{AlertKind, Alerter};
use crate::report::classify::Outcome;
use crate::storage::MissedLog;

/// Queue of ids shared by one generation of workers
pub type JobQueue = Arc<Mutex<mpsc::Receiver<InstanceId>>>;

/// Which controller a worker belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Chases the live edge; escalates stubborn ids to the offload lane
    Live,
    /// Scans a gap; records stubborn ids as missed
    Gap,
}

/// Handles every worker needs
#[derive(Clone)]
pub struct WorkerContext {
    pub pipeline: Arc<ReportPipeline>,
    /// Offload lane
    pub escalations: mpsc::Sender<InstanceId>,
    /// Gap monitor
    pub gap_events: mpsc::Sender<GapEvent>,
    pub missed: Arc<MissedLog>,
    pub alerter: Arc<Alerter>,
    pub shutdown: watch::Receiver<bool>,
}

impl WorkerContext {
    /// Append to the recovery log, logging failures
    pub async fn record_miss(&self, instance_id: InstanceId) {
        if let Err(e) = self.missed.append(instance_id).await {
            tracing::error!(
                instance_id = instance_id,
                path = %self.missed.path().display(),
                error = %e,
                "Failed to write missed log"
            );
        }
    }

    /// Tell the gap monitor about an event; a closed monitor is ignored
    pub async fn report(&self, event: GapEvent) {
        let _ = self.gap_events.send(event).await;
    }
}

/// What one worker saw during its generation
#[derive(Debug, Clone, Default)]
pub struct WorkerReport {
    /// Lag samples in seconds, most recent window only
    pub lags: Vec<f64>,
    /// Attempts classified not found
    pub not_found: u64,
    /// Ids taken from the queue
    pub processed: u64,
}

/// Run one worker until the queue is closed and drained
pub async fn run_worker(
    ctx: WorkerContext,
    kind: WorkerKind,
    policy: RetryPolicy,
    jobs: JobQueue,
    lag_capacity: usize,
) -> WorkerReport {
    let mut rng = StdRng::from_entropy();
    let mut lags = LagWindow::new(lag_capacity);
    let mut report = WorkerReport::default();
    let mut shutdown = ctx.shutdown.clone();

    loop {
        let next = jobs.lock().await.recv().await;
        let Some(instance_id) = next else {
            break;
        };
        report.processed += 1;

        let mut state = AttemptState::default();
        loop {
            let attempt = ctx.pipeline.attempt(instance_id, state.attempt).await;
            if let Some(lag) = attempt.lag {
                lags.push(lag);
            }
            if attempt.outcome == Outcome::NotFound {
                report.not_found += 1;
            }

            match policy.next(attempt.outcome, &mut state, &mut rng) {
                Action::Finish => {
                    if kind == WorkerKind::Gap {
                        ctx.report(GapEvent::Found(instance_id)).await;
                    }
                    break;
                }
                Action::Retry(delay) => {
                    if !sleep_unless_shutdown(delay, &mut shutdown).await {
                        tracing::debug!(instance_id = instance_id, "Shutdown during retry");
                        ctx.record_miss(instance_id).await;
                        break;
                    }
                }
                Action::Escalate => {
                    tracing::debug!(
                        instance_id = instance_id,
                        outcome = %attempt.outcome,
                        attempts = state.attempt + 1,
                        "Escalating to offload"
                    );
                    if ctx.escalations.send(instance_id).await.is_err() {
                        ctx.record_miss(instance_id).await;
                    }
                    break;
                }
                Action::Abort => {
                    // The pipeline already alerted; the id is not a miss of
                    // the upstream and stays out of the gap monitor
                    ctx.record_miss(instance_id).await;
                    break;
                }
                Action::GiveUp => {
                    ctx.record_miss(instance_id).await;
                    ctx.report(GapEvent::Miss(instance_id)).await;
                    if attempt.outcome == Outcome::AccessRestricted {
                        ctx.alerter.notify(AlertKind::AccessRestricted { instance_id });
                    } else {
                        ctx.alerter.notify(AlertKind::PermanentMiss {
                            instance_id,
                            gap: kind == WorkerKind::Gap,
                        });
                    }
                    break;
                }
            }
        }
    }

    report.lags = lags.samples();
    report
}
