//! Live-edge crawling
//!
//! Fetches carnage reports for consecutive instance ids, adapting the
//! number of concurrent workers to how far behind the live edge the crawl
//! is and switching to gap mode when misses cluster.
//!
//! - [`fetcher`] - rate limited report requests
//! - [`throttle`] - global pause demanded by the upstream
//! - [`pipeline`] - one attempt: fetch, classify, normalize, write
//! - [`policy`] - retry decisions per id
//! - [`worker`] - retry loop over a shared id queue
//! - [`controller`] - period sizing and gap hand-over
//! - [`gap`] - miss density monitor and mode flag
//! - [`offload`] - patient lane for escalated ids

pub mod controller;
pub mod fetcher;
pub mod gap;
pub mod lag;
pub mod offload;
pub mod pipeline;
pub mod policy;
pub mod throttle;
pub mod worker;

use std::time::Duration;
use tokio::sync::watch;

pub use controller::{next_sizing, CrawlController, PeriodReport, Sizing};
pub use fetcher::ReportFetcher;
pub use gap::{GapEvent, GapMonitor, Mode, ModeState};
pub use offload::Offloader;
pub use pipeline::{Attempt, PipelineStats, ReportPipeline, StatsSnapshot};
pub use policy::{Action, AttemptState, RetryPolicy};
pub use throttle::ThrottleGate;
pub use worker::{WorkerContext, WorkerKind, WorkerReport};

/// Sleep for `delay` unless shutdown is signalled first
///
/// Returns false when shutdown was requested before or during the sleep.
pub async fn sleep_unless_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => match changed {
            Ok(()) => !*shutdown.borrow(),
            // Sender gone: nobody can ask for shutdown any more
            Err(_) => {
                tokio::time::sleep(delay).await;
                true
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(sleep_unless_shutdown(Duration::from_secs(30), &mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_sleep() {
        let (tx, mut rx) = watch::channel(false);
        let sleeper = tokio::spawn(async move {
            sleep_unless_shutdown(Duration::from_secs(3_600), &mut rx).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        assert!(!sleeper.await.unwrap());
    }

    #[tokio::test]
    async fn test_already_shut_down() {
        let (_tx, mut rx) = watch::channel(true);
        assert!(!sleep_unless_shutdown(Duration::from_secs(3_600), &mut rx).await);
    }
}
