//! Per-id retry policy
//!
//! Decides what a worker does after each attempt at one instance id. The
//! policy owns the counters and the jittered backoff; the I/O loop only
//! sleeps and dispatches. Randomness is injected so tests can pin it.

use rand::Rng;
use std::time::Duration;

use crate::config::{CrawlerConfig, GapConfig};
use crate::report::classify::Outcome;

/// Next step for the worker holding an id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// The id is settled
    Finish,
    /// Sleep, then try the same id again
    Retry(Duration),
    /// Hand the id to the offload lane
    Escalate,
    /// Record a permanent miss and move on
    GiveUp,
    /// Record the id for reconciliation without counting it as a miss
    Abort,
}

/// Counters of one id's retry loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptState {
    /// Zero-based attempt index; upstream-disabled pauses do not advance it
    pub attempt: u32,
    pub not_found: u32,
    pub errors: u32,
}

#[derive(Debug, Clone, Copy)]
enum Lane {
    /// Live-edge workers: escalate once the counters run out
    Live { not_found_limit: u32, error_limit: u32 },
    /// Gap workers: bounded attempts, then a permanent miss
    Gap { not_found_limit: u32, attempt_limit: u32 },
}

/// Retry policy for one worker flavour
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    lane: Lane,
    base_ms: u64,
    disabled_cooldown: Duration,
}

impl RetryPolicy {
    /// Policy of the live-edge fetch workers
    pub fn worker(config: &CrawlerConfig) -> Self {
        Self {
            lane: Lane::Live {
                not_found_limit: config.not_found_limit,
                error_limit: config.error_limit,
            },
            base_ms: config.retry_base_ms,
            disabled_cooldown: Duration::from_secs(config.disabled_cooldown_secs),
        }
    }

    /// Policy of the gap-mode workers
    pub fn gap(config: &GapConfig, base_ms: u64) -> Self {
        Self {
            lane: Lane::Gap {
                not_found_limit: config.not_found_limit,
                attempt_limit: config.attempt_limit,
            },
            base_ms,
            disabled_cooldown: Duration::from_secs(config.disabled_cooldown_secs),
        }
    }

    /// Fold one outcome into `state` and pick the next action
    pub fn next<R: Rng + ?Sized>(
        &self,
        outcome: Outcome,
        state: &mut AttemptState,
        rng: &mut R,
    ) -> Action {
        if outcome.is_found() {
            return Action::Finish;
        }

        match outcome {
            Outcome::UpstreamDisabled => return Action::Retry(self.disabled_cooldown),
            Outcome::AccessRestricted => return Action::GiveUp,
            Outcome::Unwritable => return Action::Abort,
            Outcome::NotFound => state.not_found += 1,
            _ => {}
        }

        match self.lane {
            Lane::Live {
                not_found_limit,
                error_limit,
            } => {
                match outcome {
                    Outcome::Malformed => return Action::Escalate,
                    Outcome::Transient => state.errors += 1,
                    _ => {}
                }
                if state.not_found > not_found_limit || state.errors > error_limit {
                    return Action::Escalate;
                }
                let delay = self.live_delay(state.attempt, rng);
                state.attempt += 1;
                Action::Retry(delay)
            }
            Lane::Gap {
                not_found_limit,
                attempt_limit,
            } => {
                if outcome == Outcome::Transient {
                    state.errors += 1;
                }
                if state.not_found > not_found_limit || state.attempt > attempt_limit {
                    return Action::GiveUp;
                }
                let delay = self.gap_delay(state.not_found, rng);
                state.attempt += 1;
                Action::Retry(delay)
            }
        }
    }

    /// `base - base/3 + rand[0, base * (attempt + 1))` milliseconds
    fn live_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_ms;
        let window = base.saturating_mul(u64::from(attempt) + 1).max(1);
        Duration::from_millis(base - base / 3 + rng.gen_range(0..window))
    }

    /// `2 * (base - base/2 + rand[0, base]) * max(not_found, 1)` milliseconds
    fn gap_delay<R: Rng + ?Sized>(&self, not_found: u32, rng: &mut R) -> Duration {
        let base = self.base_ms;
        let variation = base / 2;
        let jittered = base - variation + rng.gen_range(0..=2 * variation);
        Duration::from_millis(2 * jittered * u64::from(not_found.max(1)))
    }
}
