//! Completion-lag samples
//!
//! Each worker keeps the lags of its most recent found reports in a fixed
//! ring. Slots that were never written are not samples.

use std::time::Duration;

use crate::utils::median;

/// Fixed-capacity ring of lag samples in seconds
#[derive(Debug, Clone)]
pub struct LagWindow {
    slots: Vec<Option<f64>>,
    next: usize,
}

impl LagWindow {
    /// A capacity of zero is treated as one
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            next: 0,
        }
    }

    /// Record one sample, overwriting the oldest once full
    pub fn push(&mut self, lag: Duration) {
        let len = self.slots.len();
        self.slots[self.next] = Some(lag.as_secs_f64());
        self.next = (self.next + 1) % len;
    }

    /// Written samples, oldest slot first
    pub fn samples(&self) -> Vec<f64> {
        self.slots.iter().flatten().copied().collect()
    }

    pub fn median(&self) -> Option<f64> {
        median(&self.samples())
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}
