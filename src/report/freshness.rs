//! Freshness rule
//!
//! Whether a run started from its first encounter is reported differently in
//! each era of the upstream API. Three epoch boundaries split time into four
//! eras:
//!
//! | era                                 | rule                                   |
//! |-------------------------------------|----------------------------------------|
//! | before `beyond_light`               | starting phase index, per definition   |
//! | `beyond_light` .. `witch_queen`     | unknown (flag always false)            |
//! | `witch_queen` .. `haunted`          | fresh if flag or deathless, else unknown |
//! | from `haunted`                      | the flag                               |

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Freshness;

/// Scourge of the Past definitions, where phase 1 is still a fresh start
const SCOURGE_HASHES: [u32; 2] = [548_750_096, 2_812_525_063];

/// Leviathan definitions, where phase 2 is an alternate fresh start
const LEVIATHAN_HASHES: [u32; 24] = [
    2_693_136_600,
    2_693_136_601,
    2_693_136_602,
    2_693_136_603,
    2_693_136_604,
    2_693_136_605,
    89_727_599,
    287_649_202,
    1_699_948_563,
    1_875_726_950,
    3_916_343_513,
    4_039_317_196,
    417_231_112,
    508_802_457,
    757_116_822,
    771_164_842,
    1_685_065_161,
    1_800_508_819,
    2_449_714_930,
    3_446_541_099,
    4_206_123_728,
    3_912_437_239,
    3_879_860_661,
    3_857_338_478,
];

/// Epoch boundaries of the freshness rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epochs {
    /// Start of the era where the flag is always false
    pub beyond_light: DateTime<Utc>,
    /// Start of the era where the flag is false on wipes
    pub witch_queen: DateTime<Utc>,
    /// Start of the era where the flag is reliable
    pub haunted: DateTime<Utc>,
}

impl Default for Epochs {
    fn default() -> Self {
        Self {
            // 2020-11-10 09:00 PST
            beyond_light: utc(2020, 11, 10, 17),
            // 2022-02-22 09:00 PST
            witch_queen: utc(2022, 2, 22, 17),
            // 2022-05-24 10:00 PDT
            haunted: utc(2022, 5, 24, 17),
        }
    }
}

fn utc(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Inputs of the freshness rule taken from a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessInput {
    pub started_at: DateTime<Utc>,
    pub definition_hash: u32,
    pub starting_phase_index: i32,
    pub started_from_beginning: bool,
    pub deathless: bool,
}

impl Epochs {
    /// Evaluate the freshness of a run
    pub fn freshness(&self, input: &FreshnessInput) -> Freshness {
        let start = input.started_at;

        if start >= self.haunted {
            Freshness::from(input.started_from_beginning)
        } else if start < self.beyond_light {
            Freshness::from(phase_index_is_fresh(
                input.definition_hash,
                input.starting_phase_index,
            ))
        } else if start >= self.witch_queen
            && (input.started_from_beginning || input.deathless)
        {
            Freshness::Fresh
        } else {
            Freshness::Unknown
        }
    }
}

fn phase_index_is_fresh(hash: u32, phase: i32) -> bool {
    if SCOURGE_HASHES.contains(&hash) {
        phase <= 1
    } else if LEVIATHAN_HASHES.contains(&hash) {
        phase == 0 || phase == 2
    } else {
        phase == 0
    }
}
