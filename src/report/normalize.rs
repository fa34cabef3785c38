//! Report normalization
//!
//! Converts a validated [`RawReport`] into a [`NormalizedActivity`]: entries
//! grouped per participant, per-character tallies, union of time played and
//! the derived completion, freshness and flawless flags.

use chrono::Duration;
use std::collections::HashMap;

use super::freshness::{Epochs, FreshnessInput};
use super::{stat, Entry, RawReport};
use crate::models::{
    NormalizedActivity, NormalizedCharacter, NormalizedPlayer, PlayerIdentity, WeaponTally,
};
use crate::utils::error::NormalizeError;
use crate::utils::format_display_name_code;

/// Normalize a report
///
/// # Errors
///
/// Returns a [`NormalizeError`] when the report fails structural validation.
pub fn normalize(report: &RawReport, epochs: &Epochs) -> Result<NormalizedActivity, NormalizeError> {
    report.validate()?;

    let started_at = report.started_at()?;
    let duration_seconds = report.duration_seconds();

    // The first entry's completion reason stands for the whole activity
    let first = &report.entries[0];
    let completion_reason = stat(&first.values, "completionReason");

    let players: Vec<NormalizedPlayer> = group_by_participant(&report.entries)
        .into_iter()
        .map(|entries| normalize_player(&entries, started_at, completion_reason))
        .collect();

    let mut activity = NormalizedActivity {
        instance_id: report.instance_id(),
        hash: report.activity_details.director_activity_hash,
        completed: players.iter().any(|p| p.finished),
        flawless: false,
        fresh: crate::models::Freshness::Unknown,
        player_count: players.len() as i32,
        date_started: started_at,
        date_completed: started_at + Duration::seconds(i64::from(duration_seconds)),
        duration_seconds,
        membership_type: report.activity_details.membership_type,
        score: stat(&first.values, "teamScore"),
        players,
    };

    let deathless = activity.deathless();
    activity.fresh = epochs.freshness(&FreshnessInput {
        started_at,
        definition_hash: activity.hash,
        starting_phase_index: report.starting_phase_index,
        started_from_beginning: report.activity_was_started_from_beginning,
        deathless,
    });
    activity.flawless = activity.completed && deathless && activity.fresh.is_fresh();

    Ok(activity)
}

/// Group entries by membership id, keeping first-seen order
fn group_by_participant(entries: &[Entry]) -> Vec<Vec<&Entry>> {
    let mut index: HashMap<i64, usize> = HashMap::new();
    let mut groups: Vec<Vec<&Entry>> = Vec::new();

    for entry in entries {
        let id = entry.player.destiny_user_info.membership_id;
        match index.get(&id) {
            Some(&i) => groups[i].push(entry),
            None => {
                index.insert(id, groups.len());
                groups.push(vec![entry]);
            }
        }
    }

    groups
}

fn normalize_player(
    entries: &[&Entry],
    started_at: chrono::DateTime<chrono::Utc>,
    completion_reason: i32,
) -> NormalizedPlayer {
    let characters: Vec<NormalizedCharacter> = entries.iter().map(|e| normalize_character(e)).collect();

    let finished = completion_reason == 0 && characters.iter().any(|c| c.completed);

    let sessions: Vec<(i32, i32)> = characters
        .iter()
        .map(|c| (c.start_seconds, c.start_seconds + c.time_played_seconds))
        .collect();

    let info = &entries[0].player.destiny_user_info;
    let first_character = &characters[0];
    let last_seen = started_at
        + Duration::seconds(i64::from(
            first_character.start_seconds + first_character.time_played_seconds,
        ));

    let mut identity = PlayerIdentity {
        membership_id: info.membership_id,
        membership_type: None,
        last_seen,
        icon_path: None,
        display_name: None,
        bungie_global_display_name: None,
        bungie_global_display_name_code: None,
    };

    if info.membership_type != 0 {
        identity.membership_type = Some(info.membership_type);
        identity.icon_path = info.icon_path.clone();
        identity.display_name = info.display_name.clone();

        if let Some(code) = info.bungie_global_display_name_code {
            identity.bungie_global_display_name_code = Some(format_display_name_code(code));
            identity.bungie_global_display_name = info
                .bungie_global_display_name
                .clone()
                .filter(|name| !name.is_empty());
        }
    }

    NormalizedPlayer {
        finished,
        time_played_seconds: union_length(sessions),
        identity,
        characters,
        is_first_clear: false,
        sherpas: 0,
    }
}

fn normalize_character(entry: &Entry) -> NormalizedCharacter {
    let values = &entry.values;
    let extended = entry.extended.as_ref();
    let extended_stat = |key: &str| extended.map_or(0, |x| stat(&x.values, key));

    NormalizedCharacter {
        character_id: entry.character_id,
        class_hash: non_zero(entry.player.class_hash),
        emblem_hash: non_zero(entry.player.emblem_hash),
        completed: stat(values, "completed") == 1,
        score: stat(values, "score"),
        kills: stat(values, "kills"),
        deaths: stat(values, "deaths"),
        assists: stat(values, "assists"),
        precision_kills: extended_stat("precisionKills"),
        super_kills: extended_stat("weaponKillsSuper"),
        grenade_kills: extended_stat("weaponKillsGrenade"),
        melee_kills: extended_stat("weaponKillsMelee"),
        start_seconds: stat(values, "startSeconds"),
        time_played_seconds: stat(values, "timePlayedSeconds"),
        weapons: extended
            .map(|x| {
                x.weapons
                    .iter()
                    .map(|w| WeaponTally {
                        weapon_hash: w.reference_id,
                        kills: stat(&w.values, "uniqueWeaponKills"),
                        precision_kills: stat(&w.values, "uniqueWeaponPrecisionKills"),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn non_zero(hash: u32) -> Option<u32> {
    (hash != 0).then_some(hash)
}

/// Total length covered by a set of half-open `[start, end)` intervals
fn union_length(mut intervals: Vec<(i32, i32)>) -> i32 {
    intervals.retain(|(start, end)| end > start);
    intervals.sort_unstable();

    let mut total = 0;
    let mut current: Option<(i32, i32)> = None;

    for (start, end) in intervals {
        current = match current {
            Some((s, e)) if start <= e => Some((s, e.max(end))),
            Some((s, e)) => {
                total += e - s;
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }

    if let Some((s, e)) = current {
        total += e - s;
    }
    total
}
