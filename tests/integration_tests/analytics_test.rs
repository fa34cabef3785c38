//! Writer → analytics queue → batcher hand-off

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use raidcrawl::analytics::{Batcher, Sink};
use raidcrawl::queue::ANALYTICS_QUEUE;
use raidcrawl::report::classify::Outcome;
use raidcrawl::utils::error::SinkError;
use raidcrawl::NormalizedActivity;

use crate::common::{mount, ReportBuilder, TestEnv};

#[derive(Default)]
struct CollectingSink {
    rows: Mutex<Vec<NormalizedActivity>>,
    failures_left: Mutex<u32>,
}

#[async_trait]
impl Sink for CollectingSink {
    async fn insert(&self, activities: &[NormalizedActivity]) -> Result<(), SinkError> {
        let mut failures = self.failures_left.lock().await;
        if *failures > 0 {
            *failures -= 1;
            return Err(SinkError::Rejected {
                status: 500,
                body: String::from("Code: 241. Memory limit exceeded"),
            });
        }
        self.rows.lock().await.extend_from_slice(activities);
        Ok(())
    }
}

async fn stored_env(ids: std::ops::RangeInclusive<i64>) -> TestEnv {
    let env = TestEnv::start().await;
    for id in ids {
        mount(&env.server, id, 200, ReportBuilder::new(id).body()).await;
        assert_eq!(env.pipeline.attempt(id, 0).await.outcome, Outcome::Success);
    }
    env
}

#[tokio::test]
async fn test_stored_activities_reach_the_sink_with_credit() {
    let env = stored_env(1..=3).await;
    assert_eq!(env.broker.ready(ANALYTICS_QUEUE).await.len(), 3);
    env.broker.close();

    let sink = Arc::new(CollectingSink::default());
    let batcher = Batcher::new(
        env.broker.clone(),
        sink.clone(),
        8_192,
        Duration::from_secs(30),
        Duration::from_millis(50),
    );
    let (_stop, shutdown) = watch::channel(false);
    let stats = batcher.run(shutdown).await;

    assert_eq!(stats.inserted, 3);
    assert_eq!(stats.flushes, 1);
    let rows = sink.rows.lock().await;
    let ids: Vec<i64> = rows.iter().map(|a| a.instance_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    // Credit computed at commit time travels with the record
    assert!(rows[0].players[0].is_first_clear);
    assert!(!rows[1].players[0].is_first_clear);
    assert_eq!(env.broker.in_flight(ANALYTICS_QUEUE).await, 0);
}

#[tokio::test]
async fn test_failed_batch_is_redelivered_whole() {
    let env = stored_env(1..=4).await;

    let sink = Arc::new(CollectingSink::default());
    *sink.failures_left.lock().await = 1;
    let batcher = Arc::new(Batcher::new(
        env.broker.clone(),
        sink.clone(),
        4,
        Duration::from_secs(30),
        Duration::from_millis(20),
    ));
    let (stop, shutdown) = watch::channel(false);
    let handle = tokio::spawn({
        let batcher = Arc::clone(&batcher);
        async move { batcher.run(shutdown).await }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.rows.lock().await.len() < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("batch should be redelivered");

    stop.send(true).unwrap();
    let stats = handle.await.unwrap();

    assert_eq!(stats.failed_flushes, 1);
    assert_eq!(stats.requeued, 4);
    assert_eq!(stats.inserted, 4);
    let mut ids: Vec<i64> = sink.rows.lock().await.iter().map(|a| a.instance_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert!(env.broker.ready(ANALYTICS_QUEUE).await.is_empty());
    assert_eq!(env.broker.in_flight(ANALYTICS_QUEUE).await, 0);
}
