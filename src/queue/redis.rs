//! Redis reliable-queue broker
//!
//! Each queue is a list `{prefix}:{queue}` with a companion processing list
//! `{prefix}:{queue}:processing`. Consuming atomically moves a message into
//! the processing list; ack removes it from there, reject moves it back.

use ::redis::AsyncCommands;
use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use std::time::Duration;

use super::{Broker, Delivery};
use crate::config::BrokerConfig;
use crate::utils::error::QueueError;

/// Broker backed by Redis lists
#[derive(Clone)]
pub struct RedisBroker {
    pool: Pool,
    key_prefix: String,
}

impl RedisBroker {
    /// Connect and verify the server answers
    pub async fn connect(config: &BrokerConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let pool = PoolConfig::from_url(&config.redis_url)
            .builder()
            .map_err(|e| anyhow::anyhow!("Failed to create pool builder: {e}"))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .context("Failed to create Redis connection pool")?;

        let mut conn = pool.get().await.context("Failed to get Redis connection")?;
        let _: String = ::redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .context("Failed to ping Redis")?;

        tracing::info!(url = %config.redis_url, "Connected to Redis broker");

        Ok(Self {
            pool,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("{}:{}", self.key_prefix, queue)
    }

    fn processing_key(&self, queue: &str) -> String {
        format!("{}:{}:processing", self.key_prefix, queue)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, queue: &str, payload: String) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await?;
        conn.lpush::<_, _, ()>(self.ready_key(queue), payload).await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.pool.get().await?;
        let payload: Option<String> = conn
            .blmove(
                self.ready_key(queue),
                self.processing_key(queue),
                ::redis::Direction::Right,
                ::redis::Direction::Left,
                timeout.as_secs_f64(),
            )
            .await?;

        Ok(payload.map(|payload| Delivery {
            queue: queue.to_string(),
            payload,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await?;
        conn.lrem::<_, _, ()>(self.processing_key(&delivery.queue), 1, &delivery.payload)
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await?;
        ::redis::pipe()
            .atomic()
            .lrem(self.processing_key(&delivery.queue), 1, &delivery.payload)
            .ignore()
            .rpush(self.ready_key(&delivery.queue), &delivery.payload)
            .ignore()
            .query_async::<()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn restore_in_flight(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.pool.get().await?;
        let processing = self.processing_key(queue);
        let ready = self.ready_key(queue);
        let mut restored = 0;

        // Newest in-flight first onto the consuming end, so the oldest is
        // consumed first again
        loop {
            let moved: Option<String> = conn
                .lmove(
                    &processing,
                    &ready,
                    ::redis::Direction::Left,
                    ::redis::Direction::Right,
                )
                .await?;
            if moved.is_none() {
                break;
            }
            restored += 1;
        }

        if restored > 0 {
            tracing::info!(queue = queue, restored = restored, "Restored unacknowledged deliveries");
        }
        Ok(restored)
    }
}
