//! In-memory primary store
//!
//! Mirrors the relational schema closely enough to run the full commit
//! sequence. A commit works on a copy of the tables and swaps it in only
//! when the sequence finishes, so a failed or duplicate commit leaves no
//! trace. Commits are serialized by the table lock.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{apply_activity, ActivityStore, CommitResult, Credit, PriorStats, StatsDelta, StatsTx};
use crate::models::{
    InstanceId, NormalizedActivity, NormalizedCharacter, NormalizedPlayer, PlayerIdentity,
};
use crate::utils::error::StoreError;

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRow {
    pub definition_id: i32,
    pub activity: NormalizedActivity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerRow {
    pub identity: PlayerIdentity,
    pub clears: i32,
    pub fresh_clears: i32,
    pub sherpas: i32,
    pub sum_of_best: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipationRow {
    pub completed: bool,
    pub time_played_seconds: i32,
    pub sherpas: i32,
    pub is_first_clear: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsRow {
    pub clears: i32,
    pub fresh_clears: i32,
    pub sherpas: i32,
    pub trios: i32,
    pub duos: i32,
    pub solos: i32,
    pub fastest_instance_id: Option<InstanceId>,
}

/// Every table of the store
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    /// Definition hash to internal activity-type id
    pub definitions: HashMap<u32, i32>,
    /// Activity types counted by the sum of personal bests
    pub tracked_definitions: HashSet<i32>,
    pub raw: HashMap<InstanceId, Vec<u8>>,
    pub activities: BTreeMap<InstanceId, ActivityRow>,
    pub players: HashMap<i64, PlayerRow>,
    pub participations: HashMap<(InstanceId, i64), ParticipationRow>,
    /// Keyed by (instance, membership, character)
    pub characters: HashMap<(InstanceId, i64, i64), NormalizedCharacter>,
    pub stats: HashMap<(i64, i32), StatsRow>,
}

// ============================================================================
// Store
// ============================================================================

/// Primary store kept in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<MemoryTables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity definition
    ///
    /// `tracked` marks a current raid that counts toward the sum of bests.
    pub async fn add_definition(&self, hash: u32, definition_id: i32, tracked: bool) {
        let mut tables = self.tables.lock().await;
        tables.definitions.insert(hash, definition_id);
        if tracked {
            tables.tracked_definitions.insert(definition_id);
        }
    }

    /// Copy of every table
    pub async fn snapshot(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn resolve_definition(&self, hash: u32) -> Result<Option<i32>, StoreError> {
        Ok(self.tables.lock().await.definitions.get(&hash).copied())
    }

    async fn store_raw(&self, instance_id: InstanceId, compressed: &[u8]) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .raw
            .entry(instance_id)
            .or_insert_with(|| compressed.to_vec());
        Ok(())
    }

    async fn commit_activity(
        &self,
        activity: &NormalizedActivity,
        definition_id: i32,
    ) -> Result<CommitResult, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut tx = MemoryTx {
            work: tables.clone(),
        };

        match apply_activity(&mut tx, activity, definition_id).await? {
            Some(credits) => {
                *tables = tx.work;
                Ok(CommitResult::Inserted(credits))
            }
            None => Ok(CommitResult::Duplicate),
        }
    }

    async fn latest_instance_id(&self, below: InstanceId) -> Result<Option<InstanceId>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.activities.range(..below).next_back().map(|(id, _)| *id))
    }

    async fn is_stored(&self, instance_id: InstanceId) -> Result<bool, StoreError> {
        Ok(self.tables.lock().await.activities.contains_key(&instance_id))
    }
}

// ============================================================================
// Transaction
// ============================================================================

struct MemoryTx {
    work: MemoryTables,
}

#[async_trait]
impl StatsTx for MemoryTx {
    async fn insert_activity(
        &mut self,
        activity: &NormalizedActivity,
        definition_id: i32,
    ) -> Result<bool, StoreError> {
        if self.work.activities.contains_key(&activity.instance_id) {
            return Ok(false);
        }
        self.work.activities.insert(
            activity.instance_id,
            ActivityRow {
                definition_id,
                activity: activity.clone(),
            },
        );
        Ok(true)
    }

    async fn prior_stats(
        &mut self,
        membership_id: i64,
        definition_id: i32,
    ) -> Result<PriorStats, StoreError> {
        let Some(row) = self.work.stats.get(&(membership_id, definition_id)) else {
            return Ok(PriorStats::default());
        };
        let fastest_duration = row
            .fastest_instance_id
            .and_then(|id| self.work.activities.get(&id))
            .map(|a| a.activity.duration_seconds);

        Ok(PriorStats {
            clears: row.clears,
            fastest_duration,
        })
    }

    async fn upsert_player(&mut self, identity: &PlayerIdentity) -> Result<(), StoreError> {
        match self.work.players.get_mut(&identity.membership_id) {
            Some(row) => {
                let current = &mut row.identity;
                current.membership_type = identity.membership_type.or(current.membership_type);
                if identity.last_seen > current.last_seen {
                    if identity.icon_path.is_some() {
                        current.icon_path.clone_from(&identity.icon_path);
                    }
                    if identity.display_name.is_some() {
                        current.display_name.clone_from(&identity.display_name);
                    }
                    if identity.bungie_global_display_name.is_some() {
                        current
                            .bungie_global_display_name
                            .clone_from(&identity.bungie_global_display_name);
                    }
                    if identity.bungie_global_display_name_code.is_some() {
                        current
                            .bungie_global_display_name_code
                            .clone_from(&identity.bungie_global_display_name_code);
                    }
                    current.last_seen = identity.last_seen;
                }
            }
            None => {
                self.work.players.insert(
                    identity.membership_id,
                    PlayerRow {
                        identity: identity.clone(),
                        clears: 0,
                        fresh_clears: 0,
                        sherpas: 0,
                        sum_of_best: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn insert_participation(
        &mut self,
        instance_id: InstanceId,
        player: &NormalizedPlayer,
    ) -> Result<(), StoreError> {
        self.work.participations.insert(
            (instance_id, player.identity.membership_id),
            ParticipationRow {
                completed: player.finished,
                time_played_seconds: player.time_played_seconds,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn insert_character(
        &mut self,
        instance_id: InstanceId,
        membership_id: i64,
        character: &NormalizedCharacter,
    ) -> Result<(), StoreError> {
        self.work
            .characters
            .entry((instance_id, membership_id, character.character_id))
            .or_insert_with(|| character.clone());
        Ok(())
    }

    async fn ensure_stats(
        &mut self,
        membership_id: i64,
        definition_id: i32,
    ) -> Result<(), StoreError> {
        self.work
            .stats
            .entry((membership_id, definition_id))
            .or_default();
        Ok(())
    }

    async fn mark_credit(
        &mut self,
        instance_id: InstanceId,
        credit: &Credit,
    ) -> Result<(), StoreError> {
        if let Some(row) = self
            .work
            .participations
            .get_mut(&(instance_id, credit.membership_id))
        {
            row.sherpas = credit.sherpas;
            row.is_first_clear = credit.is_first_clear;
        }
        Ok(())
    }

    async fn update_stats(&mut self, delta: &StatsDelta) -> Result<(), StoreError> {
        let Some(row) = self
            .work
            .stats
            .get_mut(&(delta.membership_id, delta.definition_id))
        else {
            return Ok(());
        };

        row.sherpas += delta.sherpas;
        row.clears += 1;
        if delta.fresh {
            row.fresh_clears += 1;
        }
        match delta.player_count {
            3 => row.trios += 1,
            2 => row.duos += 1,
            1 => row.solos += 1,
            _ => {}
        }
        if delta.fastest_instance_id.is_some() {
            row.fastest_instance_id = delta.fastest_instance_id;
        }
        Ok(())
    }

    async fn update_player_totals(
        &mut self,
        membership_id: i64,
        sherpas: i32,
        fresh: bool,
    ) -> Result<(), StoreError> {
        if let Some(row) = self.work.players.get_mut(&membership_id) {
            row.clears += 1;
            row.sherpas += sherpas;
            if fresh {
                row.fresh_clears += 1;
            }
        }
        Ok(())
    }

    async fn refresh_sum_of_best(&mut self, membership_id: i64) -> Result<(), StoreError> {
        let tracked = &self.work.tracked_definitions;
        if tracked.is_empty() {
            return Ok(());
        }

        let bests: Vec<i32> = tracked
            .iter()
            .filter_map(|definition_id| self.work.stats.get(&(membership_id, *definition_id)))
            .filter_map(|row| row.fastest_instance_id)
            .filter_map(|id| self.work.activities.get(&id))
            .map(|a| a.activity.duration_seconds)
            .collect();

        if bests.len() == tracked.len() {
            if let Some(row) = self.work.players.get_mut(&membership_id) {
                row.sum_of_best = Some(bests.iter().sum());
            }
        }
        Ok(())
    }
}
