//! Analytical store batching
//!
//! Consumes normalized activities from the analytics queue and inserts them
//! into the columnar store in bulk. A batch is flushed when it reaches
//! `batch_size` records or when the flush window elapses, whichever comes
//! first. Every delivery in a batch is acknowledged after a successful
//! insert or returned to the queue after a failed one; a batch is never
//! partially acknowledged.

pub mod clickhouse;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::metrics;
use crate::models::NormalizedActivity;
use crate::queue::{Broker, Delivery, ANALYTICS_QUEUE};
use crate::utils::error::{QueueError, SinkError};

pub use self::clickhouse::ClickHouseSink;

/// Bulk insert target
#[async_trait]
pub trait Sink: Send + Sync {
    /// Insert every row or none of them
    async fn insert(&self, activities: &[NormalizedActivity]) -> Result<(), SinkError>;
}

/// Counters returned when the batcher stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherStats {
    /// Deliveries a previous consumer left unacknowledged, put back at startup
    pub restored: u64,
    /// Records inserted and acknowledged
    pub inserted: u64,
    /// Records returned to the queue after a failed insert
    pub requeued: u64,
    /// Undecodable messages acknowledged without insert
    pub dropped: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
}

struct Pending {
    delivery: Delivery,
    activity: NormalizedActivity,
}

/// Largest power of two not above `n`; zero for zero
fn power_of_two_prefix(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - n.leading_zeros())
    }
}

/// Queue consumer feeding a [`Sink`]
pub struct Batcher {
    broker: Arc<dyn Broker>,
    sink: Arc<dyn Sink>,
    batch_size: usize,
    window: Duration,
    poll: Duration,
}

impl Batcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        sink: Arc<dyn Sink>,
        batch_size: usize,
        window: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            broker,
            sink,
            batch_size: batch_size.max(1),
            window,
            poll,
        }
    }

    /// Consume until the broker closes or shutdown is signalled
    ///
    /// Deliveries left in flight by a consumer that died mid-batch are put
    /// back on the queue before the first consume.
    ///
    /// Size-triggered flushes take exactly `batch_size` records. Timer
    /// flushes take the largest power-of-two prefix of what is pending and
    /// keep the rest for the next batch. On stop, everything pending is
    /// flushed once.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> BatcherStats {
        let mut stats = BatcherStats::default();
        match self.broker.restore_in_flight(ANALYTICS_QUEUE).await {
            Ok(restored) => {
                stats.restored = restored as u64;
                tracing::info!(restored = restored, "Restored in-flight analytics deliveries");
            }
            Err(e) => tracing::warn!(error = %e, "Failed to restore in-flight deliveries"),
        }
        let mut pending: Vec<Pending> = Vec::with_capacity(self.batch_size);
        let mut deadline = Instant::now() + self.window;

        loop {
            if *shutdown.borrow() {
                tracing::info!(pending = pending.len(), "Shutdown: flushing remaining batch");
                break;
            }

            let wait = deadline
                .saturating_duration_since(Instant::now())
                .min(self.poll);
            match self.broker.consume(ANALYTICS_QUEUE, wait).await {
                Ok(Some(delivery)) => match delivery.decode::<NormalizedActivity>() {
                    Ok(activity) => pending.push(Pending { delivery, activity }),
                    Err(e) => {
                        tracing::error!(error = %e, "Dropping undecodable analytics message");
                        stats.dropped += 1;
                        if let Err(e) = self.broker.ack(&delivery).await {
                            tracing::warn!(error = %e, "Failed to ack undecodable message");
                        }
                    }
                },
                Ok(None) => {}
                Err(QueueError::Closed) => {
                    tracing::info!(pending = pending.len(), "Analytics queue closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Consume failed");
                    tokio::time::sleep(self.poll).await;
                }
            }

            if pending.len() >= self.batch_size {
                let batch: Vec<Pending> = pending.drain(..self.batch_size).collect();
                if !self.flush(batch, &mut stats).await {
                    // Requeued records come straight back; give the sink a moment
                    tokio::time::sleep(self.poll).await;
                }
                deadline = Instant::now() + self.window;
            } else if Instant::now() >= deadline {
                let take = power_of_two_prefix(pending.len());
                if take > 0 {
                    let batch: Vec<Pending> = pending.drain(..take).collect();
                    if !self.flush(batch, &mut stats).await {
                        tokio::time::sleep(self.poll).await;
                    }
                }
                deadline = Instant::now() + self.window;
            }
        }

        if !pending.is_empty() {
            self.flush(std::mem::take(&mut pending), &mut stats).await;
        }
        stats
    }

    /// Insert one batch; false when it was requeued
    async fn flush(&self, batch: Vec<Pending>, stats: &mut BatcherStats) -> bool {
        let activities: Vec<NormalizedActivity> =
            batch.iter().map(|p| p.activity.clone()).collect();
        let started = Instant::now();
        stats.flushes += 1;

        match self.sink.insert(&activities).await {
            Ok(()) => {
                for pending in &batch {
                    if let Err(e) = self.broker.ack(&pending.delivery).await {
                        tracing::warn!(error = %e, "Failed to ack delivery");
                    }
                }
                stats.inserted += batch.len() as u64;
                metrics::record_flush("ok");
                tracing::info!(
                    records = batch.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Flushed analytics batch"
                );
                true
            }
            Err(e) => {
                for pending in &batch {
                    if let Err(e) = self.broker.reject(&pending.delivery).await {
                        tracing::warn!(error = %e, "Failed to requeue delivery");
                    }
                }
                stats.requeued += batch.len() as u64;
                stats.failed_flushes += 1;
                metrics::record_flush("failed");
                tracing::error!(records = batch.len(), error = %e, "Analytics insert failed, batch requeued");
                false
            }
        }
    }
}
