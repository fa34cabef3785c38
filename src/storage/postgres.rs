//! PostgreSQL primary store
//!
//! Each commit runs in one serializable transaction. Concurrent commits for
//! different instances of the same player race on the same aggregate rows;
//! the isolation level turns those races into serialization failures, which
//! the writer replays.

use anyhow::Context;
use async_trait::async_trait;
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime, Transaction};
use tokio_postgres::{IsolationLevel, NoTls};

use super::{apply_activity, ActivityStore, CommitResult, Credit, PriorStats, StatsDelta, StatsTx};
use crate::config::DatabaseConfig;
use crate::models::{
    InstanceId, NormalizedActivity, NormalizedCharacter, NormalizedPlayer, PlayerIdentity,
};
use crate::utils::error::StoreError;

/// Tables used by the crawler; every statement is idempotent
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS activity_definition (
    id SERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    is_raid BOOLEAN NOT NULL DEFAULT true,
    is_sunset BOOLEAN NOT NULL DEFAULT false
);

CREATE TABLE IF NOT EXISTS activity_hash (
    hash BIGINT PRIMARY KEY,
    activity_id INTEGER NOT NULL REFERENCES activity_definition(id)
);

CREATE TABLE IF NOT EXISTS activity (
    instance_id BIGINT PRIMARY KEY,
    hash BIGINT NOT NULL,
    flawless BOOLEAN NOT NULL,
    completed BOOLEAN NOT NULL,
    fresh BOOLEAN,
    player_count INTEGER NOT NULL,
    date_started TIMESTAMPTZ NOT NULL,
    date_completed TIMESTAMPTZ NOT NULL,
    platform_type INTEGER NOT NULL,
    duration INTEGER NOT NULL,
    score INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS pgcr (
    instance_id BIGINT PRIMARY KEY,
    data BYTEA NOT NULL,
    date_crawled TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS player (
    membership_id BIGINT PRIMARY KEY,
    membership_type INTEGER,
    icon_path TEXT,
    display_name TEXT,
    bungie_global_display_name TEXT,
    bungie_global_display_name_code TEXT,
    last_seen TIMESTAMPTZ NOT NULL,
    clears INTEGER NOT NULL DEFAULT 0,
    fresh_clears INTEGER NOT NULL DEFAULT 0,
    sherpas INTEGER NOT NULL DEFAULT 0,
    sum_of_best INTEGER
);

CREATE TABLE IF NOT EXISTS activity_player (
    instance_id BIGINT NOT NULL REFERENCES activity(instance_id),
    membership_id BIGINT NOT NULL REFERENCES player(membership_id),
    completed BOOLEAN NOT NULL,
    time_played_seconds INTEGER NOT NULL DEFAULT 0,
    sherpas INTEGER NOT NULL DEFAULT 0,
    is_first_clear BOOLEAN NOT NULL DEFAULT false,
    PRIMARY KEY (instance_id, membership_id)
);

CREATE TABLE IF NOT EXISTS activity_character (
    instance_id BIGINT NOT NULL,
    membership_id BIGINT NOT NULL,
    character_id BIGINT NOT NULL,
    class_hash BIGINT,
    emblem_hash BIGINT,
    completed BOOLEAN NOT NULL,
    score INTEGER NOT NULL DEFAULT 0,
    kills INTEGER NOT NULL DEFAULT 0,
    assists INTEGER NOT NULL DEFAULT 0,
    deaths INTEGER NOT NULL DEFAULT 0,
    precision_kills INTEGER NOT NULL DEFAULT 0,
    super_kills INTEGER NOT NULL DEFAULT 0,
    grenade_kills INTEGER NOT NULL DEFAULT 0,
    melee_kills INTEGER NOT NULL DEFAULT 0,
    time_played_seconds INTEGER NOT NULL DEFAULT 0,
    start_seconds INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (instance_id, membership_id, character_id),
    FOREIGN KEY (instance_id, membership_id) REFERENCES activity_player(instance_id, membership_id)
);

CREATE TABLE IF NOT EXISTS activity_character_weapon (
    instance_id BIGINT NOT NULL,
    membership_id BIGINT NOT NULL,
    character_id BIGINT NOT NULL,
    weapon_hash BIGINT NOT NULL,
    kills INTEGER NOT NULL DEFAULT 0,
    precision_kills INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (instance_id, membership_id, character_id, weapon_hash)
);

CREATE TABLE IF NOT EXISTS player_stats (
    membership_id BIGINT NOT NULL REFERENCES player(membership_id),
    activity_id INTEGER NOT NULL REFERENCES activity_definition(id),
    clears INTEGER NOT NULL DEFAULT 0,
    fresh_clears INTEGER NOT NULL DEFAULT 0,
    sherpas INTEGER NOT NULL DEFAULT 0,
    trios INTEGER NOT NULL DEFAULT 0,
    duos INTEGER NOT NULL DEFAULT 0,
    solos INTEGER NOT NULL DEFAULT 0,
    fastest_instance_id BIGINT REFERENCES activity(instance_id),
    PRIMARY KEY (membership_id, activity_id)
);
"#;

/// Primary store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create the connection pool
    pub fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let mut cfg = PoolConfig::new();
        cfg.url = Some(config.postgres_url.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Create missing tables
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get PostgreSQL connection")?;
        client
            .batch_execute(SCHEMA)
            .await
            .context("Failed to create schema")?;
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for PgStore {
    async fn resolve_definition(&self, hash: u32) -> Result<Option<i32>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT activity_id FROM activity_hash WHERE hash = $1",
                &[&i64::from(hash)],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn store_raw(&self, instance_id: InstanceId, compressed: &[u8]) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                "INSERT INTO pgcr (instance_id, data) VALUES ($1, $2)
                 ON CONFLICT (instance_id) DO NOTHING",
                &[&instance_id, &compressed],
            )
            .await?;
        if rows == 0 {
            tracing::debug!(instance_id = instance_id, "Raw payload already stored");
        }
        Ok(())
    }

    async fn commit_activity(
        &self,
        activity: &NormalizedActivity,
        definition_id: i32,
    ) -> Result<CommitResult, StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .await?;
        let mut pg = PgTx { tx };

        match apply_activity(&mut pg, activity, definition_id).await? {
            Some(credits) => {
                pg.tx.commit().await?;
                Ok(CommitResult::Inserted(credits))
            }
            None => {
                pg.tx.rollback().await?;
                Ok(CommitResult::Duplicate)
            }
        }
    }

    async fn latest_instance_id(&self, below: InstanceId) -> Result<Option<InstanceId>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT MAX(instance_id) FROM activity WHERE instance_id < $1",
                &[&below],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn is_stored(&self, instance_id: InstanceId) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM activity WHERE instance_id = $1",
                &[&instance_id],
            )
            .await?;
        Ok(row.is_some())
    }
}

struct PgTx<'a> {
    tx: Transaction<'a>,
}

#[async_trait]
impl StatsTx for PgTx<'_> {
    async fn insert_activity(
        &mut self,
        activity: &NormalizedActivity,
        _definition_id: i32,
    ) -> Result<bool, StoreError> {
        let rows = self
            .tx
            .execute(
                "INSERT INTO activity (
                    instance_id, hash, flawless, completed, fresh, player_count,
                    date_started, date_completed, platform_type, duration, score
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (instance_id) DO NOTHING",
                &[
                    &activity.instance_id,
                    &i64::from(activity.hash),
                    &activity.flawless,
                    &activity.completed,
                    &activity.fresh.as_option(),
                    &activity.player_count,
                    &activity.date_started,
                    &activity.date_completed,
                    &activity.membership_type,
                    &activity.duration_seconds,
                    &activity.score,
                ],
            )
            .await?;
        Ok(rows == 1)
    }

    async fn prior_stats(
        &mut self,
        membership_id: i64,
        definition_id: i32,
    ) -> Result<PriorStats, StoreError> {
        let row = self
            .tx
            .query_opt(
                "SELECT ps.clears, a.duration
                 FROM player_stats ps
                 LEFT JOIN activity a ON ps.fastest_instance_id = a.instance_id
                 WHERE ps.membership_id = $1 AND ps.activity_id = $2",
                &[&membership_id, &definition_id],
            )
            .await?;

        Ok(row.map_or_else(PriorStats::default, |r| PriorStats {
            clears: r.get(0),
            fastest_duration: r.get(1),
        }))
    }

    async fn upsert_player(&mut self, identity: &PlayerIdentity) -> Result<(), StoreError> {
        self.tx
            .execute(
                "INSERT INTO player (
                    membership_id, membership_type, icon_path, display_name,
                    bungie_global_display_name, bungie_global_display_name_code, last_seen
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (membership_id) DO UPDATE SET
                    membership_type = COALESCE(EXCLUDED.membership_type, player.membership_type),
                    icon_path = CASE WHEN EXCLUDED.last_seen > player.last_seen
                        THEN COALESCE(EXCLUDED.icon_path, player.icon_path)
                        ELSE player.icon_path END,
                    display_name = CASE WHEN EXCLUDED.last_seen > player.last_seen
                        THEN COALESCE(EXCLUDED.display_name, player.display_name)
                        ELSE player.display_name END,
                    bungie_global_display_name = CASE WHEN EXCLUDED.last_seen > player.last_seen
                        THEN COALESCE(EXCLUDED.bungie_global_display_name, player.bungie_global_display_name)
                        ELSE player.bungie_global_display_name END,
                    bungie_global_display_name_code = CASE WHEN EXCLUDED.last_seen > player.last_seen
                        THEN COALESCE(EXCLUDED.bungie_global_display_name_code, player.bungie_global_display_name_code)
                        ELSE player.bungie_global_display_name_code END,
                    last_seen = GREATEST(EXCLUDED.last_seen, player.last_seen)",
                &[
                    &identity.membership_id,
                    &identity.membership_type,
                    &identity.icon_path,
                    &identity.display_name,
                    &identity.bungie_global_display_name,
                    &identity.bungie_global_display_name_code,
                    &identity.last_seen,
                ],
            )
            .await?;
        Ok(())
    }

    async fn insert_participation(
        &mut self,
        instance_id: InstanceId,
        player: &NormalizedPlayer,
    ) -> Result<(), StoreError> {
        self.tx
            .execute(
                "INSERT INTO activity_player (instance_id, membership_id, completed, time_played_seconds)
                 VALUES ($1, $2, $3, $4)",
                &[
                    &instance_id,
                    &player.identity.membership_id,
                    &player.finished,
                    &player.time_played_seconds,
                ],
            )
            .await?;
        Ok(())
    }

    async fn insert_character(
        &mut self,
        instance_id: InstanceId,
        membership_id: i64,
        character: &NormalizedCharacter,
    ) -> Result<(), StoreError> {
        let class_hash = character.class_hash.map(i64::from);
        let emblem_hash = character.emblem_hash.map(i64::from);

        self.tx
            .execute(
                "INSERT INTO activity_character (
                    instance_id, membership_id, character_id, class_hash, emblem_hash,
                    completed, score, kills, assists, deaths, precision_kills,
                    super_kills, grenade_kills, melee_kills, time_played_seconds, start_seconds
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ON CONFLICT DO NOTHING",
                &[
                    &instance_id,
                    &membership_id,
                    &character.character_id,
                    &class_hash,
                    &emblem_hash,
                    &character.completed,
                    &character.score,
                    &character.kills,
                    &character.assists,
                    &character.deaths,
                    &character.precision_kills,
                    &character.super_kills,
                    &character.grenade_kills,
                    &character.melee_kills,
                    &character.time_played_seconds,
                    &character.start_seconds,
                ],
            )
            .await?;

        for weapon in &character.weapons {
            self.tx
                .execute(
                    "INSERT INTO activity_character_weapon (
                        instance_id, membership_id, character_id, weapon_hash, kills, precision_kills
                    ) VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT DO NOTHING",
                    &[
                        &instance_id,
                        &membership_id,
                        &character.character_id,
                        &i64::from(weapon.weapon_hash),
                        &weapon.kills,
                        &weapon.precision_kills,
                    ],
                )
                .await?;
        }
        Ok(())
    }

    async fn ensure_stats(
        &mut self,
        membership_id: i64,
        definition_id: i32,
    ) -> Result<(), StoreError> {
        self.tx
            .execute(
                "INSERT INTO player_stats (membership_id, activity_id) VALUES ($1, $2)
                 ON CONFLICT (membership_id, activity_id) DO NOTHING",
                &[&membership_id, &definition_id],
            )
            .await?;
        Ok(())
    }

    async fn mark_credit(
        &mut self,
        instance_id: InstanceId,
        credit: &Credit,
    ) -> Result<(), StoreError> {
        self.tx
            .execute(
                "UPDATE activity_player SET sherpas = $3, is_first_clear = $4
                 WHERE instance_id = $1 AND membership_id = $2",
                &[
                    &instance_id,
                    &credit.membership_id,
                    &credit.sherpas,
                    &credit.is_first_clear,
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_stats(&mut self, delta: &StatsDelta) -> Result<(), StoreError> {
        self.tx
            .execute(
                "UPDATE player_stats SET
                    sherpas = sherpas + $3,
                    clears = clears + 1,
                    fresh_clears = fresh_clears + CASE WHEN $4 THEN 1 ELSE 0 END,
                    trios = trios + CASE WHEN $5 = 3 THEN 1 ELSE 0 END,
                    duos = duos + CASE WHEN $5 = 2 THEN 1 ELSE 0 END,
                    solos = solos + CASE WHEN $5 = 1 THEN 1 ELSE 0 END,
                    fastest_instance_id = COALESCE($6::bigint, fastest_instance_id)
                 WHERE membership_id = $1 AND activity_id = $2",
                &[
                    &delta.membership_id,
                    &delta.definition_id,
                    &delta.sherpas,
                    &delta.fresh,
                    &delta.player_count,
                    &delta.fastest_instance_id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_player_totals(
        &mut self,
        membership_id: i64,
        sherpas: i32,
        fresh: bool,
    ) -> Result<(), StoreError> {
        self.tx
            .execute(
                "UPDATE player SET
                    clears = clears + 1,
                    sherpas = sherpas + $2,
                    fresh_clears = fresh_clears + CASE WHEN $3 THEN 1 ELSE 0 END
                 WHERE membership_id = $1",
                &[&membership_id, &sherpas, &fresh],
            )
            .await?;
        Ok(())
    }

    async fn refresh_sum_of_best(&mut self, membership_id: i64) -> Result<(), StoreError> {
        self.tx
            .execute(
                "WITH expected AS (
                    SELECT COUNT(*) AS n FROM activity_definition
                    WHERE is_raid AND NOT is_sunset
                ),
                best AS (
                    SELECT SUM(a.duration)::int AS total, COUNT(a.instance_id) AS n
                    FROM player_stats ps
                    JOIN activity_definition d ON ps.activity_id = d.id
                    JOIN activity a ON ps.fastest_instance_id = a.instance_id
                    WHERE ps.membership_id = $1 AND d.is_raid AND NOT d.is_sunset
                )
                UPDATE player SET sum_of_best = best.total
                FROM best, expected
                WHERE player.membership_id = $1 AND expected.n > 0 AND best.n = expected.n",
                &[&membership_id],
            )
            .await?;
        Ok(())
    }
}
