//! Transactional writer
//!
//! Resolves the definition, stores the raw payload, commits the activity and
//! then hands follow-up work to the broker. Follow-ups are best effort: a
//! failed publish is logged and never fails the write.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{raw, ActivityStore, CommitResult};
use crate::metrics;
use crate::models::NormalizedActivity;
use crate::queue::{
    publish_json, Broker, CharacterFillRequest, PlayerRefreshRequest, ANALYTICS_QUEUE,
    CHARACTER_FILL_QUEUE, PLAYER_REFRESH_QUEUE,
};
use crate::utils::error::StoreError;
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Result of a write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Committed; credits are filled in on the returned activity
    Inserted(NormalizedActivity),
    /// Already committed by an earlier write
    Duplicate,
}

/// Writes normalized activities to the primary store
pub struct ActivityWriter {
    store: Arc<dyn ActivityStore>,
    broker: Arc<dyn Broker>,
    retry: RetryConfig,
}

impl ActivityWriter {
    /// `commit_retries` bounds replays after a serialization conflict
    pub fn new(store: Arc<dyn ActivityStore>, broker: Arc<dyn Broker>, commit_retries: u32) -> Self {
        Self {
            store,
            broker,
            retry: RetryConfig::with_delays(commit_retries, 50, 1_000),
        }
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn ActivityStore> {
        &self.store
    }

    /// Write one activity
    ///
    /// # Errors
    ///
    /// `StoreError::UnknownDefinition` when the definition hash is not known,
    /// or any database error that survived the commit retries. Nothing is
    /// committed in either case.
    pub async fn write(
        &self,
        mut activity: NormalizedActivity,
        payload: &serde_json::Value,
    ) -> Result<WriteOutcome, StoreError> {
        let result = self.commit(&activity, payload).await;

        let credits = match result {
            Ok(CommitResult::Inserted(credits)) => credits,
            Ok(CommitResult::Duplicate) => {
                debug!(instance_id = activity.instance_id, "Duplicate instance");
                metrics::record_store("duplicate");
                return Ok(WriteOutcome::Duplicate);
            }
            Err(e) => {
                error!(instance_id = activity.instance_id, error = %e, "Failed to store activity");
                metrics::record_store("failed");
                return Err(e);
            }
        };

        for credit in &credits {
            if let Some(player) = activity
                .players
                .iter_mut()
                .find(|p| p.identity.membership_id == credit.membership_id)
            {
                player.is_first_clear = credit.is_first_clear;
                player.sherpas = credit.sherpas;
            }
        }

        let sherpas: i32 = credits.iter().map(|c| c.sherpas).sum();
        if sherpas > 0 {
            info!(instance_id = activity.instance_id, sherpas = sherpas, "Sherpa clear");
        }
        metrics::record_store("inserted");

        self.enqueue_follow_ups(&activity).await;
        Ok(WriteOutcome::Inserted(activity))
    }

    async fn commit(
        &self,
        activity: &NormalizedActivity,
        payload: &serde_json::Value,
    ) -> Result<CommitResult, StoreError> {
        let definition_id = self
            .store
            .resolve_definition(activity.hash)
            .await?
            .ok_or(StoreError::UnknownDefinition(activity.hash))?;

        let compressed = raw::compress_json(payload)?;
        self.store
            .store_raw(activity.instance_id, &compressed)
            .await?;

        with_retry_if(
            &self.retry,
            || self.store.commit_activity(activity, definition_id),
            StoreError::is_serialization_failure,
        )
        .await
    }

    async fn enqueue_follow_ups(&self, activity: &NormalizedActivity) {
        let broker = self.broker.as_ref();

        if let Err(e) = publish_json(broker, ANALYTICS_QUEUE, activity).await {
            warn!(instance_id = activity.instance_id, error = %e, "Failed to enqueue analytics record");
        }

        for player in &activity.players {
            let membership_id = player.identity.membership_id;

            if player.identity.membership_type.unwrap_or(0) == 0 {
                let request = PlayerRefreshRequest { membership_id };
                if let Err(e) = publish_json(broker, PLAYER_REFRESH_QUEUE, &request).await {
                    warn!(membership_id = membership_id, error = %e, "Failed to request player refresh");
                }
            }

            for character in player.characters.iter().filter(|c| c.class_hash.is_none()) {
                let request = CharacterFillRequest {
                    membership_id,
                    character_id: character.character_id,
                    instance_id: activity.instance_id,
                };
                if let Err(e) = publish_json(broker, CHARACTER_FILL_QUEUE, &request).await {
                    warn!(
                        membership_id = membership_id,
                        character_id = character.character_id,
                        error = %e,
                        "Failed to request character fill"
                    );
                }
            }
        }
    }
}
