//! Gap mode
//!
//! Terminal misses that cluster densely mean a contiguous range the live
//! workers skipped, not scattered ids that do not exist yet. The monitor
//! watches those misses and flips the shared [`ModeState`]; the controller
//! then hands the range to a large pool of patient gap workers until enough
//! consecutive finds show the range is covered.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::GapConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::InstanceId;
use crate::notifications::{AlertKind, Alerter};

// ============================================================================
// Mode
// ============================================================================

/// Crawl strategy currently in force
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Normal = 0,
    Gap = 1,
}

/// Mode flag shared by the controller and the monitor
///
/// Only the monitor writes it. Workers and the controller read it between
/// ids.
#[derive(Debug)]
pub struct ModeState {
    mode: AtomicU8,
    gap_start: AtomicI64,
}

impl Default for ModeState {
    fn default() -> Self {
        Self {
            mode: AtomicU8::new(Mode::Normal as u8),
            gap_start: AtomicI64::new(0),
        }
    }
}

impl ModeState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mode(&self) -> Mode {
        if self.mode.load(Ordering::Acquire) == Mode::Gap as u8 {
            Mode::Gap
        } else {
            Mode::Normal
        }
    }

    pub fn is_gap(&self) -> bool {
        self.mode() == Mode::Gap
    }

    /// First id of the current gap, if in gap mode
    pub fn gap_start(&self) -> Option<InstanceId> {
        self.is_gap()
            .then(|| self.gap_start.load(Ordering::Acquire))
    }

    /// Switch to gap mode; false if already there
    pub fn enter_gap(&self, start: InstanceId) -> bool {
        let entered = self
            .mode
            .compare_exchange(
                Mode::Normal as u8,
                Mode::Gap as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if entered {
            self.gap_start.store(start, Ordering::Release);
            metrics::set_gap_mode(true);
        }
        entered
    }

    /// Switch back to normal mode; false if not in gap mode
    pub fn exit_gap(&self) -> bool {
        let exited = self
            .mode
            .compare_exchange(
                Mode::Gap as u8,
                Mode::Normal as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if exited {
            metrics::set_gap_mode(false);
        }
        exited
    }
}

// ============================================================================
// Miss window
// ============================================================================

/// Most recent terminal misses, oldest first
#[derive(Debug, Clone)]
pub struct MissWindow {
    capacity: usize,
    ids: VecDeque<InstanceId>,
}

/// A dense cluster of misses
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cluster {
    pub start: InstanceId,
    pub span: i64,
    pub density: f64,
}

impl MissWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            ids: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, id: InstanceId) {
        if self.ids.len() == self.capacity {
            self.ids.pop_front();
        }
        self.ids.push_back(id);
    }

    pub fn is_full(&self) -> bool {
        self.ids.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// `capacity / (max - min)` once full; a zero span counts as infinitely dense
    pub fn cluster(&self) -> Option<Cluster> {
        if !self.is_full() {
            return None;
        }
        let min = *self.ids.iter().min()?;
        let max = *self.ids.iter().max()?;
        let span = max - min;
        let density = if span == 0 {
            f64::INFINITY
        } else {
            self.capacity as f64 / span as f64
        };
        Some(Cluster {
            start: min,
            span,
            density,
        })
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Signals from workers to the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapEvent {
    /// An id was recorded as permanently missed
    Miss(InstanceId),
    /// A gap worker settled an id
    Found(InstanceId),
}

/// Mode change caused by one event
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    Entered(Cluster),
    Exited { successes: u32, earliest: InstanceId },
}

/// Watches misses and finds and drives the mode flag
pub struct GapMonitor {
    config: GapConfig,
    mode: Arc<ModeState>,
    window: MissWindow,
    /// Consecutive finds since entering gap mode or since the last gap miss
    run: u32,
    earliest_found: Option<InstanceId>,
    /// Misses since entering gap mode
    gap_misses: u64,
}

impl GapMonitor {
    pub fn new(config: &GapConfig, mode: Arc<ModeState>) -> Self {
        Self {
            config: config.clone(),
            mode,
            window: MissWindow::new(config.miss_window),
            run: 0,
            earliest_found: None,
            gap_misses: 0,
        }
    }

    /// Fold one event into the monitor state
    ///
    /// # Errors
    ///
    /// `Error::GapModeExhausted` once gap mode has recorded more misses than
    /// the configured ceiling.
    pub fn observe(&mut self, event: GapEvent) -> Result<Option<Transition>> {
        match event {
            GapEvent::Miss(id) if self.mode.is_gap() => {
                self.run = 0;
                self.gap_misses += 1;
                if self.gap_misses > self.config.miss_ceiling {
                    return Err(Error::GapModeExhausted {
                        start: self.mode.gap_start().unwrap_or(id),
                        misses: self.gap_misses,
                    });
                }
                Ok(None)
            }
            GapEvent::Miss(id) => {
                self.window.push(id);
                match self.window.cluster() {
                    Some(cluster) if cluster.density >= self.config.trigger_density => {
                        if !self.mode.enter_gap(cluster.start) {
                            return Ok(None);
                        }
                        self.window.clear();
                        self.run = 0;
                        self.earliest_found = None;
                        self.gap_misses = 0;
                        Ok(Some(Transition::Entered(cluster)))
                    }
                    _ => Ok(None),
                }
            }
            GapEvent::Found(_) if !self.mode.is_gap() => Ok(None),
            GapEvent::Found(id) => {
                self.run += 1;
                self.earliest_found = Some(self.earliest_found.map_or(id, |e| e.min(id)));
                if self.run < self.config.exit_successes || !self.mode.exit_gap() {
                    return Ok(None);
                }
                let transition = Transition::Exited {
                    successes: self.run,
                    earliest: self.earliest_found.unwrap_or(id),
                };
                self.run = 0;
                self.earliest_found = None;
                Ok(Some(transition))
            }
        }
    }

    /// Consume events until every sender is gone
    ///
    /// # Errors
    ///
    /// Returns `Error::GapModeExhausted` after raising a critical alert.
    pub async fn run(mut self, mut events: mpsc::Receiver<GapEvent>, alerter: Arc<Alerter>) -> Result<()> {
        while let Some(event) = events.recv().await {
            match self.observe(event) {
                Ok(Some(Transition::Entered(cluster))) => {
                    alerter.notify(AlertKind::GapModeEntered {
                        start: cluster.start,
                        span: cluster.span,
                        density: cluster.density,
                    });
                }
                Ok(Some(Transition::Exited {
                    successes,
                    earliest,
                })) => {
                    alerter.notify(AlertKind::GapModeExited {
                        successes,
                        earliest,
                    });
                }
                Ok(None) => {}
                Err(Error::GapModeExhausted { start, misses }) => {
                    alerter
                        .send(AlertKind::GapModeExhausted { start, misses })
                        .await;
                    return Err(Error::GapModeExhausted { start, misses });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
