//! Adaptive crawl controller
//!
//! Crawls forward from a cursor in periods. Each period one generation of
//! workers shares a bounded queue of consecutive ids; when the generation
//! has drained, the median completion lag and the not-found fraction decide
//! how many workers the next period gets and how long it runs.
//!
//! ```text
//!            ┌──────────── period ────────────┐
//! cursor ──▶ │ feed ids ─▶ N workers ─▶ drain │ ──▶ next_sizing ──▶ ...
//!            └────────────────────────────────┘
//!                   │ gap mode entered
//!                   ▼
//!            gap pool scans from the gap start until the monitor exits
//! ```

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use super::gap::ModeState;
use super::policy::RetryPolicy;
use super::worker::{run_worker, JobQueue, WorkerContext, WorkerKind, WorkerReport};
use crate::config::{CrawlerConfig, GapConfig};
use crate::metrics;
use crate::models::InstanceId;
use crate::notifications::AlertKind;
use crate::utils::median;

/// Worker count and length of one period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sizing {
    pub workers: usize,
    pub period_length: u64,
}

/// Size the next period from what the last one observed
///
/// With no not-found responses the crawler is keeping up, so it pushes
/// harder the further the median lag sits above target. Otherwise the
/// worker count shrinks with the excess not-found fraction, never by more
/// than `max_decrease`, and the period is rescaled to the new count.
pub fn next_sizing(
    config: &CrawlerConfig,
    workers: usize,
    median_lag_secs: f64,
    not_found_fraction: f64,
) -> Sizing {
    let current = workers as f64;

    let (next, period_length) = if not_found_fraction == 0.0 {
        let behind = median_lag_secs.ceil() - config.lag_target_secs;
        let period = (current * 4.0 * behind / 3.0).max(config.period_floor as f64);
        let next = (current * (1.0 + (median_lag_secs - config.lag_target_secs) / 100.0)).ceil();
        (next, Some(period as u64))
    } else {
        let decrease = (config.decrease_gain * (not_found_fraction - config.not_found_floor))
            .min(config.max_decrease);
        let scaled = current - decrease * current;
        let next = if decrease > 0.0 {
            scaled.floor()
        } else {
            scaled.ceil()
        };
        (next, None)
    };

    let workers = (next.max(0.0) as usize).clamp(config.min_workers, config.max_workers);
    let period_length = period_length.unwrap_or(config.ids_per_worker * workers as u64);

    Sizing {
        workers,
        period_length,
    }
}

/// Observations of one finished period
#[derive(Debug, Clone, Default)]
pub struct PeriodReport {
    /// Ids handed to workers
    pub fed: u64,
    pub lags: Vec<f64>,
    pub not_found: u64,
}

impl PeriodReport {
    fn absorb(&mut self, worker: WorkerReport) {
        self.lags.extend(worker.lags);
        self.not_found += worker.not_found;
    }

    /// Median lag in seconds; zero without samples
    pub fn median_lag(&self) -> f64 {
        median(&self.lags).unwrap_or(0.0)
    }

    /// Not-found attempts per id fed
    pub fn not_found_fraction(&self) -> f64 {
        self.not_found as f64 / self.fed.max(1) as f64
    }
}

/// Drives the live crawl and hands over to the gap pool when told to
pub struct CrawlController {
    crawler: CrawlerConfig,
    gap: GapConfig,
    ctx: WorkerContext,
    mode: Arc<ModeState>,
    cursor: InstanceId,
    sizing: Sizing,
}

impl CrawlController {
    /// Start after `cursor`; the first id crawled is `cursor + 1`
    pub fn new(
        crawler: &CrawlerConfig,
        gap: &GapConfig,
        ctx: WorkerContext,
        mode: Arc<ModeState>,
        cursor: InstanceId,
    ) -> Self {
        Self {
            crawler: crawler.clone(),
            gap: gap.clone(),
            ctx,
            mode,
            cursor,
            sizing: Sizing {
                workers: crawler.start_workers.clamp(crawler.min_workers, crawler.max_workers),
                period_length: crawler.initial_period_length,
            },
        }
    }

    /// Last id handed to a worker
    pub fn cursor(&self) -> InstanceId {
        self.cursor
    }

    pub fn sizing(&self) -> Sizing {
        self.sizing
    }

    fn shutting_down(&self) -> bool {
        *self.ctx.shutdown.borrow()
    }

    /// Crawl until shutdown
    pub async fn run(&mut self) {
        while !self.shutting_down() {
            if self.mode.is_gap() {
                self.run_gap().await;
                self.sizing.workers = self.crawler.max_workers;
            } else {
                self.run_period().await;
            }
        }
        tracing::info!(cursor = self.cursor, "Crawl controller stopped");
    }

    /// Run one live period and resize for the next
    pub async fn run_period(&mut self) -> PeriodReport {
        let Sizing {
            workers,
            period_length,
        } = self.sizing;

        tracing::info!(
            workers = workers,
            period_length = period_length,
            cursor = self.cursor,
            "Starting period"
        );
        metrics::set_active_workers(workers);

        let policy = RetryPolicy::worker(&self.crawler);
        let (report, fed) = self
            .run_generation(WorkerKind::Live, policy, workers, self.crawler.job_queue_capacity, Some(period_length))
            .await;
        let report = PeriodReport { fed, ..report };

        let median_lag = report.median_lag();
        let fraction = report.not_found_fraction();
        self.sizing = next_sizing(&self.crawler, workers, median_lag, fraction);

        tracing::info!(
            median_lag_secs = median_lag,
            not_found_percent = fraction * 100.0,
            workers = workers,
            next_workers = self.sizing.workers,
            next_period_length = self.sizing.period_length,
            "Period finished"
        );
        self.ctx.alerter.notify(AlertKind::PeriodSummary {
            median_lag_secs: median_lag,
            not_found_percent: fraction * 100.0,
            workers,
            next_workers: self.sizing.workers,
            next_period_length: self.sizing.period_length,
        });

        report
    }

    /// Scan from the gap start until the monitor leaves gap mode
    async fn run_gap(&mut self) {
        if let Some(start) = self.mode.gap_start() {
            self.cursor = start - 1;
        }
        tracing::warn!(
            cursor = self.cursor,
            workers = self.gap.workers,
            "Gap mode: scanning forward"
        );
        metrics::set_active_workers(self.gap.workers);

        let policy = RetryPolicy::gap(&self.gap, self.crawler.retry_base_ms);
        let (_, fed) = self
            .run_generation(WorkerKind::Gap, policy, self.gap.workers, self.gap.miss_window, None)
            .await;

        tracing::info!(cursor = self.cursor, scanned = fed, "Gap mode finished");
    }

    /// Feed consecutive ids to a fresh generation and wait for it to drain
    ///
    /// Live generations stop feeding after `limit` ids or on entering gap
    /// mode; gap generations stop on leaving it. Both stop on shutdown.
    async fn run_generation(
        &mut self,
        kind: WorkerKind,
        policy: RetryPolicy,
        workers: usize,
        capacity: usize,
        limit: Option<u64>,
    ) -> (PeriodReport, u64) {
        let (tx, rx) = mpsc::channel::<InstanceId>(capacity.max(1));
        let jobs: JobQueue = Arc::new(Mutex::new(rx));

        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            tasks.spawn(run_worker(
                self.ctx.clone(),
                kind,
                policy,
                Arc::clone(&jobs),
                self.crawler.lag_window,
            ));
        }

        let mut fed = 0u64;
        loop {
            if self.shutting_down() || limit.is_some_and(|l| fed >= l) {
                break;
            }
            let keep_going = match kind {
                WorkerKind::Live => !self.mode.is_gap(),
                WorkerKind::Gap => self.mode.is_gap(),
            };
            if !keep_going {
                break;
            }

            if tx.send(self.cursor + 1).await.is_err() {
                break;
            }
            self.cursor += 1;
            fed += 1;
        }
        drop(tx);

        let mut report = PeriodReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(worker) => report.absorb(worker),
                Err(e) => tracing::error!(error = %e, "Worker task failed"),
            }
        }

        (report, fed)
    }
}
