//! Sherpa credit
//!
//! A sherpa event happens when at least one finisher had already cleared the
//! activity and at least one finisher had not. Every first-time finisher is
//! marked as a first clear; every experienced finisher is credited with one
//! sherpa per first-time finisher.

use serde::{Deserialize, Serialize};

/// A participant who finished, with their clears before this activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finisher {
    pub membership_id: i64,
    pub prior_clears: i32,
}

/// Credit assigned to one finisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    pub membership_id: i64,
    pub is_first_clear: bool,
    pub sherpas: i32,
}

/// Assign credit to every finisher, in input order
pub fn assign_credits(finishers: &[Finisher]) -> Vec<Credit> {
    let first_timers = finishers.iter().filter(|f| f.prior_clears == 0).count() as i32;
    let any_experienced = finishers.iter().any(|f| f.prior_clears > 0);
    let sherpa_event = any_experienced && first_timers > 0;

    finishers
        .iter()
        .map(|f| {
            let first_clear = f.prior_clears == 0;
            Credit {
                membership_id: f.membership_id,
                is_first_clear: first_clear,
                sherpas: if sherpa_event && !first_clear {
                    first_timers
                } else {
                    0
                },
            }
        })
        .collect()
}
