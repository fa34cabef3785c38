//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use raidcrawl::config::ApiConfig;
use raidcrawl::crawler::{ReportFetcher, ReportPipeline};
use raidcrawl::notifications::channels::{ChannelResult, DeliveryStatus};
use raidcrawl::notifications::{Alert, AlertKind, Alerter, Channel};
use raidcrawl::queue::MemoryBroker;
use raidcrawl::report::freshness::Epochs;
use raidcrawl::storage::{ActivityWriter, MemoryStore};

/// Definition hash registered in every test store
pub const RAID_HASH: u32 = 1_541_433_876;

/// Internal id of [`RAID_HASH`]
pub const RAID_DEFINITION: i32 = 14;

/// One participant of a test report
#[derive(Debug, Clone, Copy)]
pub struct Participant {
    pub membership_id: i64,
    pub character_id: i64,
    pub completed: bool,
    pub deaths: u32,
}

impl Participant {
    pub fn finisher(membership_id: i64) -> Self {
        Self {
            membership_id,
            character_id: membership_id + 1_000,
            completed: true,
            deaths: 0,
        }
    }
}

/// Report body builder
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    pub instance_id: i64,
    pub period: String,
    pub mode: i32,
    pub hash: u32,
    pub started_from_beginning: bool,
    pub participants: Vec<Participant>,
    pub throttle_seconds: i64,
}

impl ReportBuilder {
    pub fn new(instance_id: i64) -> Self {
        Self {
            instance_id,
            period: String::from("2024-06-07T17:00:00Z"),
            mode: 4,
            hash: RAID_HASH,
            started_from_beginning: true,
            participants: vec![Participant::finisher(4_611_686_018_000_000_001)],
            throttle_seconds: 0,
        }
    }

    pub fn participants(mut self, participants: Vec<Participant>) -> Self {
        self.participants = participants;
        self
    }

    pub fn mode(mut self, mode: i32) -> Self {
        self.mode = mode;
        self
    }

    pub fn hash(mut self, hash: u32) -> Self {
        self.hash = hash;
        self
    }

    pub fn period(mut self, period: &str) -> Self {
        self.period = period.to_string();
        self
    }

    fn entry(&self, p: &Participant, player_count: usize) -> Value {
        json!({
            "player": {
                "destinyUserInfo": {
                    "membershipId": p.membership_id.to_string(),
                    "membershipType": 3,
                    "displayName": "Guardian",
                    "bungieGlobalDisplayName": "Guardian",
                    "bungieGlobalDisplayNameCode": 7
                },
                "classHash": 2_271_682_572u32,
                "emblemHash": 1_409_726_931u32
            },
            "characterId": p.character_id.to_string(),
            "values": {
                "playerCount": { "basic": { "value": player_count as f64 } },
                "activityDurationSeconds": { "basic": { "value": 2_400.0 } },
                "completed": { "basic": { "value": if p.completed { 1.0 } else { 0.0 } } },
                "completionReason": { "basic": { "value": 0.0 } },
                "deaths": { "basic": { "value": f64::from(p.deaths) } },
                "kills": { "basic": { "value": 120.0 } },
                "assists": { "basic": { "value": 15.0 } },
                "startSeconds": { "basic": { "value": 0.0 } },
                "timePlayedSeconds": { "basic": { "value": 2_400.0 } },
                "teamScore": { "basic": { "value": 0.0 } }
            },
            "extended": {
                "values": { "precisionKills": { "basic": { "value": 50.0 } } },
                "weapons": [{
                    "referenceId": 1_363_886_209u32,
                    "values": {
                        "uniqueWeaponKills": { "basic": { "value": 70.0 } },
                        "uniqueWeaponPrecisionKills": { "basic": { "value": 35.0 } }
                    }
                }]
            }
        })
    }

    /// The `Response` object
    pub fn report(&self) -> Value {
        let entries: Vec<Value> = self
            .participants
            .iter()
            .map(|p| self.entry(p, self.participants.len()))
            .collect();

        json!({
            "period": self.period,
            "startingPhaseIndex": 0,
            "activityWasStartedFromBeginning": self.started_from_beginning,
            "activityDetails": {
                "directorActivityHash": self.hash,
                "instanceId": self.instance_id.to_string(),
                "mode": self.mode,
                "membershipType": 3
            },
            "entries": entries
        })
    }

    /// Full success envelope
    pub fn body(&self) -> Value {
        json!({
            "Response": self.report(),
            "ErrorCode": 1,
            "ThrottleSeconds": self.throttle_seconds,
            "ErrorStatus": "Success",
            "Message": "Ok"
        })
    }
}

/// Error envelope with a platform error code
pub fn error_body(code: i32, status: &str) -> Value {
    json!({
        "ErrorCode": code,
        "ThrottleSeconds": 0,
        "ErrorStatus": status,
        "Message": status
    })
}

pub fn not_found_body() -> Value {
    error_body(1653, "DestinyPGCRNotFound")
}

pub fn report_path(instance_id: i64) -> String {
    format!("/Platform/Destiny2/Stats/PostGameCarnageReport/{instance_id}/")
}

/// Serve `body` with `status` for one instance id
pub async fn mount(server: &MockServer, instance_id: i64, status: u16, body: Value) {
    Mock::given(method("GET"))
        .and(path(report_path(instance_id)))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(server)
        .await;
}

/// Channel that keeps every alert it is given
#[derive(Default)]
pub struct RecordingChannel {
    alerts: Mutex<Vec<AlertKind>>,
}

impl RecordingChannel {
    pub fn alerts(&self) -> Vec<AlertKind> {
        self.alerts.lock().unwrap().clone()
    }

    /// Wait for background deliveries to land
    pub async fn wait_for(&self, count: usize) -> Vec<AlertKind> {
        for _ in 0..100 {
            if self.alerts.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.alerts()
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, alert: &Alert) -> ChannelResult<DeliveryStatus> {
        self.alerts.lock().unwrap().push(alert.kind.clone());
        Ok(DeliveryStatus::success("recording"))
    }
}

/// Mock upstream, in-memory store and broker wired into one pipeline
pub struct TestEnv {
    pub server: MockServer,
    pub store: MemoryStore,
    pub broker: Arc<MemoryBroker>,
    pub pipeline: Arc<ReportPipeline>,
    /// Alerts raised by the pipeline
    pub alerts: Arc<RecordingChannel>,
}

impl TestEnv {
    pub async fn start() -> Self {
        let alerts = Arc::new(RecordingChannel::default());
        let mut alerter = Alerter::new(100, Duration::from_secs(1));
        alerter.add_channel(alerts.clone());

        let server = MockServer::start().await;
        let store = MemoryStore::new();
        store.add_definition(RAID_HASH, RAID_DEFINITION, true).await;
        let broker = Arc::new(MemoryBroker::new());

        let api = ApiConfig {
            requests_per_second: 1_000,
            request_timeout_secs: 5,
            ..ApiConfig::default()
        };
        let fetcher = ReportFetcher::with_base_url(&server.uri(), &api).unwrap();
        let writer = ActivityWriter::new(Arc::new(store.clone()), broker.clone(), 2);
        let pipeline = Arc::new(
            ReportPipeline::new(Arc::new(fetcher), Arc::new(writer), Epochs::default())
                .with_alerter(Arc::new(alerter)),
        );

        Self {
            server,
            store,
            broker,
            pipeline,
            alerts,
        }
    }
}
