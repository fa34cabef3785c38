//! ClickHouse sink
//!
//! Bulk inserts over the HTTP interface: one POST per batch with a
//! `JSONEachRow` body, one line per activity and nested arrays for players,
//! characters and weapons.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::Sink;
use crate::config::AnalyticsConfig;
use crate::models::{Freshness, NormalizedActivity};
use crate::utils::error::SinkError;

/// Activity row as the columnar table stores it
#[derive(Debug, Serialize)]
pub struct InstanceRow {
    pub instance_id: i64,
    pub hash: u32,
    pub completed: bool,
    pub player_count: i32,
    /// 0 false, 1 true, 2 unknown
    pub fresh: u8,
    pub flawless: u8,
    pub date_started: String,
    pub date_completed: String,
    pub platform_type: u16,
    pub duration: i32,
    pub score: i32,
    pub players: Vec<PlayerRow>,
}

#[derive(Debug, Serialize)]
pub struct PlayerRow {
    pub membership_id: i64,
    pub completed: bool,
    pub time_played_seconds: i32,
    pub sherpas: i32,
    pub is_first_clear: bool,
    pub characters: Vec<CharacterRow>,
}

#[derive(Debug, Serialize)]
pub struct CharacterRow {
    pub character_id: i64,
    /// 0 when unknown
    pub class_hash: u32,
    pub emblem_hash: u32,
    pub completed: bool,
    pub score: i32,
    pub kills: i32,
    pub assists: i32,
    pub deaths: i32,
    pub precision_kills: i32,
    pub super_kills: i32,
    pub grenade_kills: i32,
    pub melee_kills: i32,
    pub time_played_seconds: i32,
    pub start_seconds: i32,
    pub weapons: Vec<WeaponRow>,
}

#[derive(Debug, Serialize)]
pub struct WeaponRow {
    pub weapon_hash: u32,
    pub kills: i32,
    pub precision_kills: i32,
}

fn tri_state(freshness: Freshness) -> u8 {
    match freshness.as_option() {
        Some(false) => 0,
        Some(true) => 1,
        None => 2,
    }
}

impl From<&NormalizedActivity> for InstanceRow {
    fn from(activity: &NormalizedActivity) -> Self {
        let timestamp = |t: &chrono::DateTime<chrono::Utc>| t.format("%Y-%m-%d %H:%M:%S").to_string();

        Self {
            instance_id: activity.instance_id,
            hash: activity.hash,
            completed: activity.completed,
            player_count: activity.player_count,
            fresh: tri_state(activity.fresh),
            flawless: u8::from(activity.flawless),
            date_started: timestamp(&activity.date_started),
            date_completed: timestamp(&activity.date_completed),
            platform_type: u16::try_from(activity.membership_type).unwrap_or(0),
            duration: activity.duration_seconds,
            score: activity.score,
            players: activity
                .players
                .iter()
                .map(|p| PlayerRow {
                    membership_id: p.identity.membership_id,
                    completed: p.finished,
                    time_played_seconds: p.time_played_seconds,
                    sherpas: p.sherpas,
                    is_first_clear: p.is_first_clear,
                    characters: p
                        .characters
                        .iter()
                        .map(|c| CharacterRow {
                            character_id: c.character_id,
                            class_hash: c.class_hash.unwrap_or(0),
                            emblem_hash: c.emblem_hash.unwrap_or(0),
                            completed: c.completed,
                            score: c.score,
                            kills: c.kills,
                            assists: c.assists,
                            deaths: c.deaths,
                            precision_kills: c.precision_kills,
                            super_kills: c.super_kills,
                            grenade_kills: c.grenade_kills,
                            melee_kills: c.melee_kills,
                            time_played_seconds: c.time_played_seconds,
                            start_seconds: c.start_seconds,
                            weapons: c
                                .weapons
                                .iter()
                                .map(|w| WeaponRow {
                                    weapon_hash: w.weapon_hash,
                                    kills: w.kills,
                                    precision_kills: w.precision_kills,
                                })
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Encode activities as a `JSONEachRow` body
pub fn encode_rows(activities: &[NormalizedActivity]) -> Result<String, SinkError> {
    let mut body = String::new();
    for activity in activities {
        body.push_str(&serde_json::to_string(&InstanceRow::from(activity))?);
        body.push('\n');
    }
    Ok(body)
}

/// Sink writing to a ClickHouse table over HTTP
pub struct ClickHouseSink {
    client: Client,
    url: String,
    table: String,
    user: Option<String>,
    password: Option<String>,
}

impl ClickHouseSink {
    /// # Errors
    ///
    /// `SinkError::Http` if the HTTP client cannot be built
    pub fn new(config: &AnalyticsConfig) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            url: config.clickhouse_url.trim_end_matches('/').to_string(),
            table: config.table.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    fn insert_query(&self) -> String {
        format!("INSERT INTO {} FORMAT JSONEachRow", self.table)
    }
}

#[async_trait]
impl Sink for ClickHouseSink {
    async fn insert(&self, activities: &[NormalizedActivity]) -> Result<(), SinkError> {
        if activities.is_empty() {
            return Ok(());
        }

        let mut request = self
            .client
            .post(format!("{}/", self.url))
            .query(&[("query", self.insert_query())])
            .body(encode_rows(activities)?);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
