//! Primary store
//!
//! Every accepted report is committed exactly once. The commit is a single
//! transaction that inserts the activity, its participants and characters,
//! and updates the running aggregates (clears, sherpas, personal bests).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   ActivityWriter                     │
//! │  resolve definition → raw payload → commit → enqueue │
//! └──────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌──────────────────────────────────────────────────────┐
//! │          ActivityStore  /  StatsTx (per commit)      │
//! └──────────────────────────────────────────────────────┘
//!              │                           │
//!              ▼                           ▼
//!     ┌─────────────────┐         ┌─────────────────┐
//!     │     PgStore     │         │   MemoryStore   │
//!     └─────────────────┘         └─────────────────┘
//! ```
//!
//! Both stores run the same commit sequence, [`apply_activity`], against
//! their own transaction type.

pub mod memory;
pub mod missed;
pub mod postgres;
pub mod raw;
pub mod sherpa;
pub mod writer;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::models::{
    InstanceId, NormalizedActivity, NormalizedCharacter, NormalizedPlayer, PlayerIdentity,
};
use crate::utils::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::missed::MissedLog;
pub use self::postgres::PgStore;
pub use self::sherpa::Credit;
pub use self::writer::{ActivityWriter, WriteOutcome};

/// Upper bound on instance ids considered by the startup cursor
pub const INSTANCE_ID_CEILING: InstanceId = 1_000_000_000_000;

// ============================================================================
// Core Types
// ============================================================================

/// Result of one commit attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    /// Rows were written; one credit per finisher
    Inserted(Vec<Credit>),
    /// The instance was already committed; nothing changed
    Duplicate,
}

/// A player's standing for one activity type before the current commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorStats {
    pub clears: i32,
    /// Duration of the fastest fresh clear on record
    pub fastest_duration: Option<i32>,
}

/// Aggregate update for one finisher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsDelta {
    pub membership_id: i64,
    pub definition_id: i32,
    pub sherpas: i32,
    pub fresh: bool,
    pub player_count: i32,
    /// Set when this run becomes the new fastest fresh clear
    pub fastest_instance_id: Option<InstanceId>,
}

// ============================================================================
// Store Traits
// ============================================================================

/// Primary store operations used by the crawler
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Internal activity-type id for a definition hash
    async fn resolve_definition(&self, hash: u32) -> Result<Option<i32>, StoreError>;

    /// Store the compressed raw payload; an existing row is left as is
    async fn store_raw(&self, instance_id: InstanceId, compressed: &[u8]) -> Result<(), StoreError>;

    /// Commit one activity with every aggregate update, or nothing at all
    async fn commit_activity(
        &self,
        activity: &NormalizedActivity,
        definition_id: i32,
    ) -> Result<CommitResult, StoreError>;

    /// Highest stored instance id strictly below `below`
    async fn latest_instance_id(&self, below: InstanceId) -> Result<Option<InstanceId>, StoreError>;

    /// Whether an activity row exists for the instance
    async fn is_stored(&self, instance_id: InstanceId) -> Result<bool, StoreError>;
}

/// Statements issued inside one commit transaction
#[async_trait]
pub trait StatsTx: Send {
    /// Insert the activity row; `false` when the instance already exists
    async fn insert_activity(
        &mut self,
        activity: &NormalizedActivity,
        definition_id: i32,
    ) -> Result<bool, StoreError>;

    async fn prior_stats(
        &mut self,
        membership_id: i64,
        definition_id: i32,
    ) -> Result<PriorStats, StoreError>;

    async fn upsert_player(&mut self, identity: &PlayerIdentity) -> Result<(), StoreError>;

    async fn insert_participation(
        &mut self,
        instance_id: InstanceId,
        player: &NormalizedPlayer,
    ) -> Result<(), StoreError>;

    /// Insert one character row together with its weapon tallies
    async fn insert_character(
        &mut self,
        instance_id: InstanceId,
        membership_id: i64,
        character: &NormalizedCharacter,
    ) -> Result<(), StoreError>;

    /// Create the per-activity-type stats row when missing
    async fn ensure_stats(&mut self, membership_id: i64, definition_id: i32)
        -> Result<(), StoreError>;

    /// Record first-clear and sherpa credit on the participation row
    async fn mark_credit(&mut self, instance_id: InstanceId, credit: &Credit)
        -> Result<(), StoreError>;

    async fn update_stats(&mut self, delta: &StatsDelta) -> Result<(), StoreError>;

    async fn update_player_totals(
        &mut self,
        membership_id: i64,
        sherpas: i32,
        fresh: bool,
    ) -> Result<(), StoreError>;

    /// Recompute the sum of personal bests; left untouched unless every
    /// tracked activity type has a best
    async fn refresh_sum_of_best(&mut self, membership_id: i64) -> Result<(), StoreError>;
}

// ============================================================================
// Commit Sequence
// ============================================================================

/// Run the commit sequence inside an open transaction
///
/// Returns `None` when the activity row already exists; the caller must then
/// roll back. On `Some` the caller commits.
pub async fn apply_activity<T>(
    tx: &mut T,
    activity: &NormalizedActivity,
    definition_id: i32,
) -> Result<Option<Vec<Credit>>, StoreError>
where
    T: StatsTx + ?Sized,
{
    if !tx.insert_activity(activity, definition_id).await? {
        return Ok(None);
    }

    let mut priors: HashMap<i64, PriorStats> = HashMap::with_capacity(activity.players.len());
    let mut finishers = Vec::new();

    for player in &activity.players {
        let membership_id = player.identity.membership_id;
        let prior = tx.prior_stats(membership_id, definition_id).await?;

        tx.upsert_player(&player.identity).await?;
        tx.insert_participation(activity.instance_id, player).await?;
        tx.ensure_stats(membership_id, definition_id).await?;
        for character in &player.characters {
            tx.insert_character(activity.instance_id, membership_id, character)
                .await?;
        }

        if player.finished {
            finishers.push(sherpa::Finisher {
                membership_id,
                prior_clears: prior.clears,
            });
        }
        priors.insert(membership_id, prior);
    }

    let credits = sherpa::assign_credits(&finishers);
    let fresh = activity.fresh.is_fresh();

    for credit in &credits {
        tx.mark_credit(activity.instance_id, credit).await?;

        let prior_fastest = priors
            .get(&credit.membership_id)
            .and_then(|p| p.fastest_duration);
        let new_best =
            fresh && prior_fastest.map_or(true, |best| activity.duration_seconds < best);

        tx.update_stats(&StatsDelta {
            membership_id: credit.membership_id,
            definition_id,
            sherpas: credit.sherpas,
            fresh,
            player_count: activity.player_count,
            fastest_instance_id: new_best.then_some(activity.instance_id),
        })
        .await?;
        tx.update_player_totals(credit.membership_id, credit.sherpas, fresh)
            .await?;

        if new_best {
            tx.refresh_sum_of_best(credit.membership_id).await?;
        }
    }

    Ok(Some(credits))
}
