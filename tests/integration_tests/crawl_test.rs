//! Worker, offload and controller tests against a mock upstream
//!
//! Delays are configured down to milliseconds; the clock is real because the
//! mock server answers over real sockets.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch, Mutex};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, ResponseTemplate};

use raidcrawl::config::{CrawlerConfig, GapConfig, OffloadConfig};
use raidcrawl::crawler::worker::{run_worker, JobQueue};
use raidcrawl::crawler::{
    CrawlController, GapEvent, GapMonitor, Mode, ModeState, Offloader, RetryPolicy,
    WorkerContext, WorkerKind,
};
use raidcrawl::models::InstanceId;
use raidcrawl::notifications::Alerter;
use raidcrawl::storage::MissedLog;

use crate::common::{error_body, mount, not_found_body, report_path, ReportBuilder, TestEnv};

struct Harness {
    env: TestEnv,
    _dir: TempDir,
    missed: Arc<MissedLog>,
    ctx: WorkerContext,
    escalations: mpsc::Receiver<InstanceId>,
    gap_events: Option<mpsc::Receiver<GapEvent>>,
    stop: watch::Sender<bool>,
}

async fn harness() -> Harness {
    let env = TestEnv::start().await;
    let dir = TempDir::new().unwrap();
    let missed = Arc::new(MissedLog::new(dir.path().join("missed.log")));
    let (esc_tx, escalations) = mpsc::channel(64);
    let (gap_tx, gap_rx) = mpsc::channel(256);
    let (stop, shutdown) = watch::channel(false);

    let ctx = WorkerContext {
        pipeline: Arc::clone(&env.pipeline),
        escalations: esc_tx,
        gap_events: gap_tx,
        missed: Arc::clone(&missed),
        alerter: Arc::new(Alerter::disabled()),
        shutdown,
    };

    Harness {
        env,
        _dir: dir,
        missed,
        ctx,
        escalations,
        gap_events: Some(gap_rx),
        stop,
    }
}

fn fast_crawler() -> CrawlerConfig {
    CrawlerConfig {
        start_workers: 2,
        min_workers: 1,
        max_workers: 4,
        initial_period_length: 10,
        retry_base_ms: 1,
        disabled_cooldown_secs: 0,
        ..CrawlerConfig::default()
    }
}

fn fast_gap() -> GapConfig {
    GapConfig {
        miss_window: 5,
        workers: 2,
        exit_successes: 3,
        miss_ceiling: 1_000,
        disabled_cooldown_secs: 0,
        ..GapConfig::default()
    }
}

fn fast_offload() -> OffloadConfig {
    OffloadConfig {
        max_attempts: 2,
        disabled_cooldown_secs: 0,
        backoff_unit_secs: 0,
        ..OffloadConfig::default()
    }
}

fn queue_of(ids: &[InstanceId]) -> JobQueue {
    let (tx, rx) = mpsc::channel(ids.len().max(1));
    for id in ids {
        tx.try_send(*id).unwrap();
    }
    Arc::new(Mutex::new(rx))
}

async fn read_log(missed: &MissedLog) -> String {
    tokio::fs::read_to_string(missed.path()).await.unwrap_or_default()
}

// ============================================================================
// Worker Tests
// ============================================================================

#[tokio::test]
async fn test_live_worker_escalates_after_not_found_limit() {
    let mut h = harness().await;
    mount(&h.env.server, 7, 404, not_found_body()).await;

    let config = fast_crawler();
    let report = run_worker(
        h.ctx.clone(),
        WorkerKind::Live,
        RetryPolicy::worker(&config),
        queue_of(&[7]),
        50,
    )
    .await;

    assert_eq!(report.processed, 1);
    assert_eq!(report.not_found, u64::from(config.not_found_limit) + 1);
    assert_eq!(h.escalations.try_recv().unwrap(), 7);
    assert!(read_log(&h.missed).await.is_empty());
}

#[tokio::test]
async fn test_live_worker_collects_lag_samples() {
    let h = harness().await;
    for id in 1..=3 {
        mount(&h.env.server, id, 200, ReportBuilder::new(id).body()).await;
    }

    let report = run_worker(
        h.ctx.clone(),
        WorkerKind::Live,
        RetryPolicy::worker(&fast_crawler()),
        queue_of(&[1, 2, 3]),
        2,
    )
    .await;

    assert_eq!(report.processed, 3);
    assert_eq!(report.lags.len(), 2);
    assert_eq!(h.env.store.snapshot().await.activities.len(), 3);
}

#[tokio::test]
async fn test_gap_worker_records_permanent_miss() {
    let mut h = harness().await;
    mount(&h.env.server, 9, 404, not_found_body()).await;

    let gap = fast_gap();
    run_worker(
        h.ctx.clone(),
        WorkerKind::Gap,
        RetryPolicy::gap(&gap, 1),
        queue_of(&[9]),
        50,
    )
    .await;

    assert_eq!(read_log(&h.missed).await, "9\n");
    let mut events = h.gap_events.take().unwrap();
    assert!(matches!(events.try_recv(), Ok(GapEvent::Miss(9))));
    assert!(h.escalations.try_recv().is_err());
}

#[tokio::test]
async fn test_unknown_definition_is_recorded_but_not_a_miss() {
    let mut h = harness().await;
    // One attempt per worker, no retries
    Mock::given(method("GET"))
        .and(path(report_path(13)))
        .respond_with(ResponseTemplate::new(200).set_body_json(ReportBuilder::new(13).hash(42).body()))
        .expect(2)
        .mount(&h.env.server)
        .await;

    let live = RetryPolicy::worker(&fast_crawler());
    run_worker(h.ctx.clone(), WorkerKind::Live, live, queue_of(&[13]), 50).await;
    let gap = RetryPolicy::gap(&fast_gap(), 1);
    run_worker(h.ctx.clone(), WorkerKind::Gap, gap, queue_of(&[13]), 50).await;

    assert_eq!(read_log(&h.missed).await, "13\n13\n");
    assert!(h.escalations.try_recv().is_err());
    let mut events = h.gap_events.take().unwrap();
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_restricted_report_is_not_retried() {
    let h = harness().await;
    Mock::given(method("GET"))
        .and(path(report_path(11)))
        .respond_with(ResponseTemplate::new(403).set_body_json(error_body(12, "InsufficientPrivileges")))
        .expect(1)
        .mount(&h.env.server)
        .await;

    run_worker(
        h.ctx.clone(),
        WorkerKind::Live,
        RetryPolicy::worker(&fast_crawler()),
        queue_of(&[11]),
        50,
    )
    .await;

    assert_eq!(read_log(&h.missed).await, "11\n");
}

// ============================================================================
// Offload Tests
// ============================================================================

#[tokio::test]
async fn test_offload_recovers_after_transient_failure() {
    let h = harness().await;
    Mock::given(method("GET"))
        .and(path(report_path(21)))
        .respond_with(ResponseTemplate::new(500).set_body_json(error_body(1618, "UnhandledException")))
        .up_to_n_times(1)
        .mount(&h.env.server)
        .await;
    mount(&h.env.server, 21, 200, ReportBuilder::new(21).body()).await;

    let offloader = Offloader::new(
        &fast_offload(),
        Arc::clone(&h.env.pipeline),
        Arc::clone(&h.missed),
        Arc::new(Alerter::disabled()),
        h.ctx.shutdown.clone(),
    );

    assert!(offloader.retry(21).await);
    assert!(h.env.store.snapshot().await.activities.contains_key(&21));
    assert!(read_log(&h.missed).await.is_empty());
}

#[tokio::test]
async fn test_offload_exhaustion_lands_in_missed_log() {
    let h = harness().await;
    Mock::given(method("GET"))
        .and(path(report_path(22)))
        .respond_with(ResponseTemplate::new(404).set_body_json(not_found_body()))
        .expect(2)
        .mount(&h.env.server)
        .await;

    let (gap_tx, mut gap_rx) = mpsc::channel(4);
    let offloader = Offloader::new(
        &fast_offload(),
        Arc::clone(&h.env.pipeline),
        Arc::clone(&h.missed),
        Arc::new(Alerter::disabled()),
        h.ctx.shutdown.clone(),
    )
    .with_gap_events(gap_tx);

    assert!(!offloader.retry(22).await);
    assert_eq!(read_log(&h.missed).await, "22\n");
    assert!(matches!(gap_rx.try_recv(), Ok(GapEvent::Miss(22))));
}

#[tokio::test]
async fn test_offload_stops_at_unknown_definition() {
    let h = harness().await;
    Mock::given(method("GET"))
        .and(path(report_path(23)))
        .respond_with(ResponseTemplate::new(200).set_body_json(ReportBuilder::new(23).hash(42).body()))
        .expect(1)
        .mount(&h.env.server)
        .await;

    let (gap_tx, mut gap_rx) = mpsc::channel(4);
    let offloader = Offloader::new(
        &fast_offload(),
        Arc::clone(&h.env.pipeline),
        Arc::clone(&h.missed),
        Arc::new(Alerter::disabled()),
        h.ctx.shutdown.clone(),
    )
    .with_gap_events(gap_tx);

    assert!(!offloader.retry(23).await);
    assert_eq!(read_log(&h.missed).await, "23\n");
    assert!(gap_rx.try_recv().is_err());
}

// ============================================================================
// Controller Tests
// ============================================================================

#[tokio::test]
async fn test_period_crawls_consecutive_ids_and_resizes() {
    let h = harness().await;
    for id in 101..=110 {
        mount(&h.env.server, id, 200, ReportBuilder::new(id).body()).await;
    }

    let crawler = fast_crawler();
    let mut controller =
        CrawlController::new(&crawler, &fast_gap(), h.ctx.clone(), ModeState::new(), 100);
    let report = controller.run_period().await;

    assert_eq!(report.fed, 10);
    assert_eq!(report.not_found, 0);
    assert_eq!(controller.cursor(), 110);
    assert_eq!(h.env.store.snapshot().await.activities.len(), 10);

    // Reports are long past their completion, so the crawl is far behind
    assert_eq!(controller.sizing().workers, crawler.max_workers);
    assert!(controller.sizing().period_length >= crawler.period_floor);
}

#[tokio::test]
async fn test_gap_scan_exits_after_consecutive_successes() {
    let mut h = harness().await;
    // Every id resolves to the same stored report: the first is stored, the
    // rest are duplicates, and all of them count as found
    Mock::given(method("GET"))
        .and(path_regex(r"^/Platform/Destiny2/Stats/PostGameCarnageReport/\d+/$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ReportBuilder::new(500).body()))
        .mount(&h.env.server)
        .await;

    let mode = ModeState::new();
    assert!(mode.enter_gap(200));

    let gap = fast_gap();
    let monitor = GapMonitor::new(&gap, Arc::clone(&mode));
    let alerter = Arc::new(Alerter::disabled());
    let events = h.gap_events.take().unwrap();
    let monitor_task = tokio::spawn(monitor.run(events, alerter));

    let mut controller = CrawlController::new(
        &fast_crawler(),
        &gap,
        h.ctx.clone(),
        Arc::clone(&mode),
        10_000,
    );
    let controller_task = tokio::spawn(async move {
        controller.run().await;
        controller.cursor()
    });

    tokio::time::timeout(Duration::from_secs(10), async {
        while mode.is_gap() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("gap mode should end");
    assert_eq!(mode.mode(), Mode::Normal);

    h.stop.send(true).unwrap();
    let cursor = controller_task.await.unwrap();
    // Scanning restarted just before the gap start, not from the old cursor
    assert!(cursor >= 199 + i64::from(gap.exit_successes));
    assert!(cursor < 10_000);

    drop(h.ctx);
    monitor_task.abort();
}
