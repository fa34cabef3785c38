//! Global throttle gate
//!
//! Any response may demand that every caller pause. The gate stores the
//! earliest instant at which the next request may be sent; every request
//! waits on it first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Process-wide "not before" instant
#[derive(Debug)]
pub struct ThrottleGate {
    origin: Instant,
    /// Milliseconds after `origin`
    not_before_ms: AtomicU64,
}

impl Default for ThrottleGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleGate {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            not_before_ms: AtomicU64::new(0),
        }
    }

    /// Hold every request back for at least `pause` from now
    pub fn pause_for(&self, pause: Duration) {
        let until = self.origin.elapsed() + pause;
        let until_ms = u64::try_from(until.as_millis()).unwrap_or(u64::MAX);
        let previous = self.not_before_ms.fetch_max(until_ms, Ordering::SeqCst);

        if until_ms > previous {
            tracing::warn!(pause_secs = pause.as_secs(), "Upstream requested a global pause");
        }
    }

    /// Remaining pause, if any
    pub fn remaining(&self) -> Option<Duration> {
        let not_before = Duration::from_millis(self.not_before_ms.load(Ordering::SeqCst));
        not_before.checked_sub(self.origin.elapsed()).filter(|d| !d.is_zero())
    }

    /// Wait until requests are allowed again
    pub async fn wait(&self) {
        while let Some(remaining) = self.remaining() {
            tokio::time::sleep(remaining).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_for_pause() {
        let gate = ThrottleGate::new();
        assert!(gate.remaining().is_none());

        gate.pause_for(Duration::from_secs(3));
        let started = Instant::now();
        gate.wait().await;
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(gate.remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_pause_does_not_shrink_longer_one() {
        let gate = ThrottleGate::new();
        gate.pause_for(Duration::from_secs(10));
        gate.pause_for(Duration::from_secs(1));

        let remaining = gate.remaining().unwrap();
        assert!(remaining > Duration::from_secs(9));
    }
}
