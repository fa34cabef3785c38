//! In-process broker used by tests and single-binary runs

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::{Broker, Delivery};
use crate::utils::error::QueueError;

#[derive(Debug, Default)]
struct Queues {
    ready: HashMap<String, VecDeque<String>>,
    in_flight: HashMap<String, Vec<String>>,
}

/// Broker backed by in-memory queues
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<Queues>,
    notify: Notify,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop delivering once the queues drain
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Messages waiting in a queue
    pub async fn ready(&self, queue: &str) -> Vec<String> {
        let queues = self.queues.lock().await;
        queues
            .ready
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages delivered but not yet acknowledged
    pub async fn in_flight(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.in_flight.get(queue).map_or(0, Vec::len)
    }

    async fn try_take(&self, queue: &str) -> Option<Delivery> {
        let mut queues = self.queues.lock().await;
        let payload = queues.ready.get_mut(queue)?.pop_front()?;
        queues
            .in_flight
            .entry(queue.to_string())
            .or_default()
            .push(payload.clone());
        Some(Delivery {
            queue: queue.to_string(),
            payload,
        })
    }

    async fn remove_in_flight(&self, delivery: &Delivery) -> bool {
        let mut queues = self.queues.lock().await;
        let Some(list) = queues.in_flight.get_mut(&delivery.queue) else {
            return false;
        };
        match list.iter().position(|p| *p == delivery.payload) {
            Some(i) => {
                list.remove(i);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, payload: String) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        self.queues
            .lock()
            .await
            .ready
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();

            if let Some(delivery) = self.try_take(queue).await {
                return Ok(Some(delivery));
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.remove_in_flight(delivery).await;
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if self.remove_in_flight(delivery).await {
            let mut queues = self.queues.lock().await;
            queues
                .ready
                .entry(delivery.queue.clone())
                .or_default()
                .push_front(delivery.payload.clone());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn restore_in_flight(&self, queue: &str) -> Result<usize, QueueError> {
        let mut queues = self.queues.lock().await;
        let taken = queues.in_flight.remove(queue).unwrap_or_default();
        let restored = taken.len();
        let ready = queues.ready.entry(queue.to_string()).or_default();
        for payload in taken.into_iter().rev() {
            ready.push_front(payload);
        }
        drop(queues);

        if restored > 0 {
            self.notify.notify_waiters();
        }
        Ok(restored)
    }
}
