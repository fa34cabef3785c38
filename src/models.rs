//! Core data structures
//!
//! Normalized activity records produced from a carnage report and consumed by
//! the primary store writer and the analytics batcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dense, upstream-assigned identity of one played match
pub type InstanceId = i64;

/// Tri-state freshness of a run
///
/// Some eras of the upstream API cannot tell whether a run was started from
/// the beginning, so `Unknown` is a real value and is stored as NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    NotFresh,
    Unknown,
}

impl Freshness {
    /// Nullable boolean view used by the stores
    pub fn as_option(self) -> Option<bool> {
        match self {
            Self::Fresh => Some(true),
            Self::NotFresh => Some(false),
            Self::Unknown => None,
        }
    }

    pub fn is_fresh(self) -> bool {
        self == Self::Fresh
    }
}

impl From<bool> for Freshness {
    fn from(value: bool) -> Self {
        if value {
            Self::Fresh
        } else {
            Self::NotFresh
        }
    }
}

/// Canonical form of one accepted report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedActivity {
    pub instance_id: InstanceId,
    /// Activity definition hash
    pub hash: u32,
    /// Any participant finished under completion reason 0
    pub completed: bool,
    /// Completed, deathless and fresh; never unknown
    pub flawless: bool,
    pub fresh: Freshness,
    /// Number of distinct participant identities
    pub player_count: i32,
    pub date_started: DateTime<Utc>,
    pub date_completed: DateTime<Utc>,
    pub duration_seconds: i32,
    /// Platform the activity was launched from
    pub membership_type: i32,
    pub score: i32,
    pub players: Vec<NormalizedPlayer>,
}

impl NormalizedActivity {
    /// Zero deaths across every character of every participant
    pub fn deathless(&self) -> bool {
        self.players
            .iter()
            .flat_map(|p| p.characters.iter())
            .all(|c| c.deaths == 0)
    }
}

/// One distinct participant within an activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedPlayer {
    pub finished: bool,
    /// Length of the union of this player's character sessions
    pub time_played_seconds: i32,
    pub identity: PlayerIdentity,
    pub characters: Vec<NormalizedCharacter>,
    /// Assigned by the writer
    pub is_first_clear: bool,
    /// Assigned by the writer
    pub sherpas: i32,
}

/// Identity fields of a participant
///
/// Display fields are only present when the account was visible in the
/// report (membership type non-zero).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerIdentity {
    pub membership_id: i64,
    pub membership_type: Option<i32>,
    pub last_seen: DateTime<Utc>,
    pub icon_path: Option<String>,
    pub display_name: Option<String>,
    pub bungie_global_display_name: Option<String>,
    pub bungie_global_display_name_code: Option<String>,
}

/// One character used by a participant within a match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedCharacter {
    pub character_id: i64,
    pub class_hash: Option<u32>,
    pub emblem_hash: Option<u32>,
    pub completed: bool,
    pub score: i32,
    pub kills: i32,
    pub deaths: i32,
    pub assists: i32,
    pub precision_kills: i32,
    pub super_kills: i32,
    pub grenade_kills: i32,
    pub melee_kills: i32,
    pub start_seconds: i32,
    pub time_played_seconds: i32,
    pub weapons: Vec<WeaponTally>,
}

/// Per-weapon tally of one character
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeaponTally {
    pub weapon_hash: u32,
    pub kills: i32,
    pub precision_kills: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_option_view() {
        assert_eq!(Freshness::Fresh.as_option(), Some(true));
        assert_eq!(Freshness::NotFresh.as_option(), Some(false));
        assert_eq!(Freshness::Unknown.as_option(), None);
        assert_eq!(Freshness::from(true), Freshness::Fresh);
    }

    #[test]
    fn test_freshness_serializes_lowercase() {
        let json = serde_json::to_string(&Freshness::Unknown).unwrap();
        assert_eq!(json, "\"unknown\"");
    }
}
