//! Message broker seam
//!
//! Work handed off outside the hot crawl path travels over named queues:
//! normalized activities for the analytical store and small backfill
//! requests for profile and character lookups.
//!
//! Delivery is at-least-once. A consumer acknowledges a [`Delivery`] only
//! after durable processing; a rejected delivery goes back to its queue, and
//! deliveries left unsettled by a consumer that died are restored when the
//! next consumer starts.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::InstanceId;
use crate::utils::error::QueueError;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// Normalized activities waiting for the analytical store
pub const ANALYTICS_QUEUE: &str = "analytics";

/// Players whose profile should be refreshed
pub const PLAYER_REFRESH_QUEUE: &str = "player_refresh";

/// Characters whose class is still unknown
pub const CHARACTER_FILL_QUEUE: &str = "character_fill";

/// One message taken from a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    pub payload: String,
}

impl Delivery {
    /// Decode the payload as JSON
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Durable queue transport
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a message to a queue
    async fn publish(&self, queue: &str, payload: String) -> Result<(), QueueError>;

    /// Take the next message, waiting up to `timeout`
    ///
    /// Returns `Ok(None)` when nothing arrived in time and
    /// `Err(QueueError::Closed)` once the broker will never deliver again.
    async fn consume(&self, queue: &str, timeout: Duration)
        -> Result<Option<Delivery>, QueueError>;

    /// Confirm durable processing of a delivery
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return a delivery to its queue for redelivery
    async fn reject(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Put back every delivery a previous consumer of `queue` took but never
    /// acknowledged or rejected, ahead of newer messages
    ///
    /// Consumers call this once before their first `consume`. Returns the
    /// number of deliveries restored.
    async fn restore_in_flight(&self, queue: &str) -> Result<usize, QueueError>;
}

/// Publish a JSON-encoded message
pub async fn publish_json<T: Serialize + ?Sized>(
    broker: &dyn Broker,
    queue: &str,
    message: &T,
) -> Result<(), QueueError> {
    let payload = serde_json::to_string(message)?;
    broker.publish(queue, payload).await
}

/// Request to refresh a player's profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRefreshRequest {
    pub membership_id: i64,
}

/// Request to look up a character's class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterFillRequest {
    pub membership_id: i64,
    pub character_id: i64,
    pub instance_id: InstanceId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_json_round_trips_through_delivery() {
        let broker = MemoryBroker::new();
        let request = CharacterFillRequest {
            membership_id: 4_611_686_018_467_284_386,
            character_id: 2_305_843_009_301_648_414,
            instance_id: 14_000_000_000,
        };

        publish_json(&broker, CHARACTER_FILL_QUEUE, &request)
            .await
            .unwrap();

        let delivery = broker
            .consume(CHARACTER_FILL_QUEUE, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let decoded: CharacterFillRequest = delivery.decode().unwrap();
        assert_eq!(decoded, request);
    }
}
