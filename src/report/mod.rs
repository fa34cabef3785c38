//! Carnage report wire types
//!
//! This module mirrors the subset of the platform API's post-game carnage
//! report that the crawler consumes, plus the envelope every API response is
//! wrapped in.
//!
//! - [`classify`] - maps an HTTP response to an [`classify::Outcome`]
//! - [`normalize`] - turns a report into a [`crate::models::NormalizedActivity`]
//! - [`freshness`] - epoch-keyed freshness rule

pub mod classify;
pub mod freshness;
pub mod normalize;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

use crate::utils::error::NormalizeError;

/// Response envelope shared by every platform API endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope<T> {
    /// Payload, present on success
    #[serde(default)]
    pub response: Option<T>,

    /// Platform error code (1 is success)
    #[serde(default)]
    pub error_code: i32,

    /// Seconds every caller must wait before the next request
    #[serde(default)]
    pub throttle_seconds: i64,

    /// Symbolic error status
    #[serde(default)]
    pub error_status: String,

    /// Human readable message
    #[serde(default)]
    pub message: String,
}

/// One post-game carnage report
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReport {
    /// RFC 3339 start timestamp
    pub period: String,

    /// Phase index the activity was launched at
    #[serde(default)]
    pub starting_phase_index: i32,

    /// Whether the activity was started from its first encounter
    #[serde(default)]
    pub activity_was_started_from_beginning: bool,

    pub activity_details: ActivityDetails,

    /// One entry per participating character
    #[serde(default)]
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityDetails {
    pub director_activity_hash: u32,

    #[serde(deserialize_with = "i64_from_string_or_number")]
    pub instance_id: i64,

    #[serde(default)]
    pub mode: i32,

    #[serde(default)]
    pub membership_type: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub player: EntryPlayer,

    #[serde(deserialize_with = "i64_from_string_or_number")]
    pub character_id: i64,

    #[serde(default)]
    pub values: StatMap,

    #[serde(default)]
    pub extended: Option<Extended>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPlayer {
    pub destiny_user_info: UserInfo,

    #[serde(default)]
    pub class_hash: u32,

    #[serde(default)]
    pub emblem_hash: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(deserialize_with = "i64_from_string_or_number")]
    pub membership_id: i64,

    /// Zero when the account is hidden from the report
    #[serde(default)]
    pub membership_type: i32,

    #[serde(default)]
    pub icon_path: Option<String>,

    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub bungie_global_display_name: Option<String>,

    #[serde(default)]
    pub bungie_global_display_name_code: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extended {
    #[serde(default)]
    pub values: StatMap,

    #[serde(default)]
    pub weapons: Vec<WeaponEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeaponEntry {
    pub reference_id: u32,

    #[serde(default)]
    pub values: StatMap,
}

/// Statistic keyed by name
pub type StatMap = HashMap<String, StatValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatValue {
    pub basic: BasicValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicValue {
    pub value: f64,

    #[serde(default)]
    pub display_value: Option<String>,
}

/// Read a statistic, truncating toward zero; missing keys read as 0
pub fn stat(values: &StatMap, key: &str) -> i32 {
    values.get(key).map_or(0, |v| v.basic.value as i32)
}

impl RawReport {
    /// The report's instance id
    pub fn instance_id(&self) -> i64 {
        self.activity_details.instance_id
    }

    /// Parsed start timestamp
    pub fn started_at(&self) -> Result<DateTime<Utc>, NormalizeError> {
        DateTime::parse_from_rfc3339(&self.period)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| NormalizeError::InvalidPeriod {
                instance_id: self.instance_id(),
                period: self.period.clone(),
            })
    }

    /// Activity duration as reported on the first entry
    pub fn duration_seconds(&self) -> i32 {
        self.entries
            .first()
            .map_or(0, |e| stat(&e.values, "activityDurationSeconds"))
    }

    /// Start time plus the reported duration
    pub fn completed_at(&self) -> Result<DateTime<Utc>, NormalizeError> {
        Ok(self.started_at()? + chrono::Duration::seconds(i64::from(self.duration_seconds())))
    }

    /// Structural checks every stored report must pass
    pub fn validate(&self) -> Result<(), NormalizeError> {
        let instance_id = self.instance_id();
        let first = self
            .entries
            .first()
            .ok_or(NormalizeError::NoEntries { instance_id })?;

        let expected = i64::from(stat(&first.values, "playerCount"));
        if expected >= 0 && self.entries.len() as i64 != expected {
            return Err(NormalizeError::EntryCountMismatch {
                instance_id,
                expected,
                actual: self.entries.len(),
            });
        }

        let anyone_played = self
            .entries
            .iter()
            .any(|e| stat(&e.values, "activityDurationSeconds") != 0);
        if !anyone_played {
            return Err(NormalizeError::NoDuration { instance_id });
        }

        self.started_at()?;
        Ok(())
    }
}

fn i64_from_string_or_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(i64),
    }

    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s.parse::<i64>().map_err(serde::de::Error::custom),
        StringOrNumber::Number(n) => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(player_count: f64, duration: f64) -> serde_json::Value {
        json!({
            "player": { "destinyUserInfo": { "membershipId": "4611686018467284386", "membershipType": 3 } },
            "characterId": "2305843009301648414",
            "values": {
                "playerCount": { "basic": { "value": player_count } },
                "activityDurationSeconds": { "basic": { "value": duration } }
            }
        })
    }

    fn report(entries: Vec<serde_json::Value>) -> RawReport {
        serde_json::from_value(json!({
            "period": "2023-03-10T17:00:00Z",
            "activityDetails": { "directorActivityHash": 1441982566, "instanceId": "12685770593", "mode": 4 },
            "entries": entries
        }))
        .unwrap()
    }

    #[test]
    fn test_ids_decode_from_strings() {
        let r = report(vec![entry(1.0, 1800.0)]);
        assert_eq!(r.instance_id(), 12_685_770_593);
        assert_eq!(r.entries[0].player.destiny_user_info.membership_id, 4_611_686_018_467_284_386);
    }

    #[test]
    fn test_completed_at_adds_duration() {
        let r = report(vec![entry(1.0, 1800.0)]);
        let completed = r.completed_at().unwrap();
        assert_eq!(completed.to_rfc3339(), "2023-03-10T17:30:00+00:00");
    }

    #[test]
    fn test_validate_entry_count_mismatch() {
        let r = report(vec![entry(3.0, 1800.0)]);
        assert!(matches!(
            r.validate(),
            Err(NormalizeError::EntryCountMismatch { expected: 3, actual: 1, .. })
        ));
    }

    #[test]
    fn test_validate_zero_duration() {
        let r = report(vec![entry(2.0, 0.0), entry(2.0, 0.0)]);
        assert!(matches!(r.validate(), Err(NormalizeError::NoDuration { .. })));
    }

    #[test]
    fn test_validate_no_entries() {
        let r = report(vec![]);
        assert!(matches!(r.validate(), Err(NormalizeError::NoEntries { .. })));
    }

    #[test]
    fn test_stat_truncates() {
        let mut values = StatMap::new();
        values.insert(
            "kills".into(),
            StatValue {
                basic: BasicValue {
                    value: 12.9,
                    display_value: None,
                },
            },
        );
        assert_eq!(stat(&values, "kills"), 12);
        assert_eq!(stat(&values, "deaths"), 0);
    }
}
