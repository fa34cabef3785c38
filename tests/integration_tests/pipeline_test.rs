//! End-to-end attempt tests
//!
//! Mock upstream → classify → normalize → transactional write → analytics
//! queue, against the in-memory store and broker.

use raidcrawl::models::Freshness;
use raidcrawl::notifications::AlertKind;
use raidcrawl::queue::ANALYTICS_QUEUE;
use raidcrawl::report::classify::Outcome;
use raidcrawl::NormalizedActivity;

use crate::common::{
    error_body, mount, not_found_body, Participant, ReportBuilder, TestEnv, RAID_DEFINITION,
};

const ID: i64 = 14_000_000_001;
const ALICE: i64 = 4_611_686_018_000_000_001;
const BOB: i64 = 4_611_686_018_000_000_002;

// ============================================================================
// Single Attempt Tests
// ============================================================================

#[tokio::test]
async fn test_not_found_leaves_store_untouched() {
    let env = TestEnv::start().await;
    mount(&env.server, ID, 404, not_found_body()).await;

    let attempt = env.pipeline.attempt(ID, 0).await;

    assert_eq!(attempt.outcome, Outcome::NotFound);
    assert!(attempt.lag.is_none());
    assert_eq!(env.pipeline.stats().snapshot().not_found, 1);

    let tables = env.store.snapshot().await;
    assert!(tables.activities.is_empty());
    assert!(tables.players.is_empty());
    assert!(env.broker.ready(ANALYTICS_QUEUE).await.is_empty());
}

#[tokio::test]
async fn test_solo_flawless_clear_is_stored() {
    let env = TestEnv::start().await;
    mount(&env.server, ID, 200, ReportBuilder::new(ID).body()).await;

    let attempt = env.pipeline.attempt(ID, 0).await;
    assert_eq!(attempt.outcome, Outcome::Success);
    assert!(attempt.lag.is_some());

    let tables = env.store.snapshot().await;
    let row = &tables.activities[&ID];
    assert_eq!(row.definition_id, RAID_DEFINITION);
    assert!(row.activity.completed);
    assert!(row.activity.flawless);
    assert_eq!(row.activity.fresh, Freshness::Fresh);
    assert_eq!(row.activity.player_count, 1);

    assert_eq!(tables.participations.len(), 1);
    let participation = &tables.participations[&(ID, ALICE)];
    assert!(participation.completed);
    assert!(participation.is_first_clear);
    assert_eq!(participation.sherpas, 0);

    let stats = &tables.stats[&(ALICE, RAID_DEFINITION)];
    assert_eq!(stats.clears, 1);
    assert_eq!(stats.fresh_clears, 1);
    assert_eq!(stats.solos, 1);
    assert_eq!(stats.fastest_instance_id, Some(ID));
    assert!(tables.raw.contains_key(&ID));

    let queued = env.broker.ready(ANALYTICS_QUEUE).await;
    assert_eq!(queued.len(), 1);
    let record: NormalizedActivity = serde_json::from_str(&queued[0]).unwrap();
    assert_eq!(record.instance_id, ID);
    assert!(record.players[0].is_first_clear);
}

#[tokio::test]
async fn test_replay_is_duplicate_and_aggregates_unchanged() {
    let env = TestEnv::start().await;
    mount(&env.server, ID, 200, ReportBuilder::new(ID).body()).await;

    assert_eq!(env.pipeline.attempt(ID, 0).await.outcome, Outcome::Success);
    let before = env.store.snapshot().await;

    assert_eq!(env.pipeline.attempt(ID, 0).await.outcome, Outcome::Duplicate);
    let after = env.store.snapshot().await;

    assert_eq!(after.players[&ALICE].clears, before.players[&ALICE].clears);
    assert_eq!(
        after.stats[&(ALICE, RAID_DEFINITION)],
        before.stats[&(ALICE, RAID_DEFINITION)]
    );
    assert_eq!(after.participations.len(), 1);
    assert_eq!(env.broker.ready(ANALYTICS_QUEUE).await.len(), 1);

    let snapshot = env.pipeline.stats().snapshot();
    assert_eq!(snapshot.stored, 1);
    assert_eq!(snapshot.duplicates, 1);
    assert_eq!(snapshot.found(), 2);
}

#[tokio::test]
async fn test_sherpa_credit_for_experienced_finisher() {
    let env = TestEnv::start().await;
    let first = ID;
    let second = ID + 1;

    mount(&env.server, first, 200, ReportBuilder::new(first).body()).await;
    mount(
        &env.server,
        second,
        200,
        ReportBuilder::new(second)
            .participants(vec![Participant::finisher(ALICE), Participant::finisher(BOB)])
            .body(),
    )
    .await;

    assert_eq!(env.pipeline.attempt(first, 0).await.outcome, Outcome::Success);
    assert_eq!(env.pipeline.attempt(second, 0).await.outcome, Outcome::Success);

    let tables = env.store.snapshot().await;
    let alice = &tables.participations[&(second, ALICE)];
    let bob = &tables.participations[&(second, BOB)];
    assert_eq!(alice.sherpas, 1);
    assert!(!alice.is_first_clear);
    assert_eq!(bob.sherpas, 0);
    assert!(bob.is_first_clear);

    assert_eq!(tables.players[&ALICE].sherpas, 1);
    assert_eq!(tables.players[&ALICE].clears, 2);
    assert_eq!(tables.stats[&(ALICE, RAID_DEFINITION)].duos, 1);
}

#[tokio::test]
async fn test_non_finisher_gets_no_credit() {
    let env = TestEnv::start().await;
    let leaver = Participant {
        completed: false,
        ..Participant::finisher(BOB)
    };
    mount(
        &env.server,
        ID,
        200,
        ReportBuilder::new(ID)
            .participants(vec![Participant::finisher(ALICE), leaver])
            .body(),
    )
    .await;

    assert_eq!(env.pipeline.attempt(ID, 0).await.outcome, Outcome::Success);

    let tables = env.store.snapshot().await;
    assert!(!tables.participations[&(ID, BOB)].completed);
    assert!(!tables.participations[&(ID, BOB)].is_first_clear);
    assert_eq!(tables.stats[&(BOB, RAID_DEFINITION)].clears, 0);
    assert_eq!(tables.stats[&(ALICE, RAID_DEFINITION)].clears, 1);
}

// ============================================================================
// Rejection Tests
// ============================================================================

#[tokio::test]
async fn test_other_mode_is_not_matching_type() {
    let env = TestEnv::start().await;
    mount(&env.server, ID, 200, ReportBuilder::new(ID).mode(5).body()).await;

    let attempt = env.pipeline.attempt(ID, 0).await;
    assert_eq!(attempt.outcome, Outcome::NotMatchingType);
    assert!(attempt.lag.is_some());
    assert!(env.store.snapshot().await.activities.is_empty());
}

#[tokio::test]
async fn test_entry_count_mismatch_is_malformed() {
    let env = TestEnv::start().await;
    let mut body = ReportBuilder::new(ID).body();
    body["Response"]["entries"][0]["values"]["playerCount"]["basic"]["value"] = 3.0.into();
    mount(&env.server, ID, 200, body).await;

    assert_eq!(env.pipeline.attempt(ID, 0).await.outcome, Outcome::Malformed);
    assert!(env.store.snapshot().await.activities.is_empty());
}

#[tokio::test]
async fn test_unknown_definition_aborts_with_critical_alert() {
    let env = TestEnv::start().await;
    mount(&env.server, ID, 200, ReportBuilder::new(ID).hash(42).body()).await;

    assert_eq!(env.pipeline.attempt(ID, 0).await.outcome, Outcome::Unwritable);
    let tables = env.store.snapshot().await;
    assert!(tables.activities.is_empty());
    assert!(tables.raw.is_empty());
    assert!(env.broker.ready(ANALYTICS_QUEUE).await.is_empty());

    let snapshot = env.pipeline.stats().snapshot();
    assert_eq!(snapshot.unwritable, 1);
    assert_eq!(snapshot.transient, 0);

    let alerts = env.alerts.wait_for(1).await;
    assert_eq!(
        alerts,
        vec![AlertKind::UnknownDefinition {
            instance_id: ID,
            definition_hash: 42,
        }]
    );
}

#[tokio::test]
async fn test_platform_error_codes() {
    let env = TestEnv::start().await;
    mount(&env.server, 1, 503, error_body(5, "SystemDisabled")).await;
    mount(&env.server, 2, 403, error_body(12, "InsufficientPrivileges")).await;
    mount(&env.server, 3, 500, error_body(1618, "UnhandledException")).await;

    assert_eq!(env.pipeline.attempt(1, 0).await.outcome, Outcome::UpstreamDisabled);
    assert_eq!(env.pipeline.attempt(2, 0).await.outcome, Outcome::AccessRestricted);
    assert_eq!(env.pipeline.attempt(3, 0).await.outcome, Outcome::Transient);

    let snapshot = env.pipeline.stats().snapshot();
    assert_eq!(snapshot.disabled, 1);
    assert_eq!(snapshot.restricted, 1);
    assert_eq!(snapshot.transient, 1);
    assert_eq!(snapshot.attempts, 3);
}
