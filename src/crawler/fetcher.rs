//! Carnage report fetcher
//!
//! One GET per attempt, paced by a governor rate limiter and the global
//! [`ThrottleGate`]. Every response, including transport failures, comes
//! back as a [`Classification`]; retry decisions belong to the caller.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::Client;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::throttle::ThrottleGate;
use crate::config::ApiConfig;
use crate::metrics;
use crate::models::InstanceId;
use crate::report::classify::{classify, Classification};
use crate::utils::error::FetchError;

/// Fetches and classifies carnage reports
pub struct ReportFetcher {
    /// HTTP client with configured timeout and compression
    client: Client,

    /// Rate limiter to control request frequency
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,

    /// Pause shared with every other fetcher
    gate: Arc<ThrottleGate>,

    /// Scheme and host the report path is appended to
    base_url: String,

    /// Only this activity mode is stored
    tracked_mode: i32,
}

impl ReportFetcher {
    /// Create a fetcher from the API configuration
    ///
    /// # Errors
    ///
    /// Returns `FetchError::InvalidUrl` for an unusable API key or user agent
    /// and `FetchError::Http` if the HTTP client cannot be created.
    pub fn new(config: &ApiConfig, gate: Arc<ThrottleGate>) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| FetchError::InvalidUrl(format!("user agent: {e}")))?,
        );
        if !config.api_key.is_empty() {
            headers.insert(
                "X-API-KEY",
                HeaderValue::from_str(&config.api_key)
                    .map_err(|e| FetchError::InvalidUrl(format!("api key: {e}")))?,
            );
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .gzip(true)
            .default_headers(headers)
            .build()?;

        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(rate));

        Ok(Self {
            client,
            rate_limiter,
            gate,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tracked_mode: config.tracked_mode,
        })
    }

    /// Create a fetcher pointed at another host, for mock servers
    ///
    /// # Errors
    ///
    /// Same as [`ReportFetcher::new`]
    pub fn with_base_url(base_url: &str, config: &ApiConfig) -> Result<Self, FetchError> {
        let config = ApiConfig {
            base_url: base_url.to_string(),
            ..config.clone()
        };
        Self::new(&config, Arc::new(ThrottleGate::new()))
    }

    /// The shared throttle gate
    pub fn gate(&self) -> &Arc<ThrottleGate> {
        &self.gate
    }

    /// Full URL of one report
    pub fn report_url(&self, instance_id: InstanceId) -> String {
        format!(
            "{}/Platform/Destiny2/Stats/PostGameCarnageReport/{}/",
            self.base_url, instance_id
        )
    }

    /// Fetch and classify one report
    pub async fn fetch(&self, instance_id: InstanceId) -> Classification {
        self.gate.wait().await;
        self.rate_limiter.until_ready().await;

        let classification = match self.request(instance_id).await {
            Ok((status, body)) => classify(status, &body, self.tracked_mode),
            Err(e) => {
                tracing::debug!(instance_id = instance_id, error = %e, "Report request failed");
                Classification::transport_failure(e.to_string())
            }
        };

        if let Some(pause) = classification.throttle {
            self.gate.pause_for(pause);
        }
        if let Some(code) = classification.error_code {
            metrics::record_error_code(code);
        }

        classification
    }

    async fn request(&self, instance_id: InstanceId) -> Result<(u16, Vec<u8>), FetchError> {
        let response = self
            .client
            .get(self.report_url(instance_id))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Http(e)
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))?;

        Ok((status, body.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::classify::Outcome;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_config() -> ApiConfig {
        ApiConfig {
            api_key: "test-key".into(),
            requests_per_second: 1000,
            ..ApiConfig::default()
        }
    }

    #[test]
    fn test_report_url() {
        let fetcher = ReportFetcher::with_base_url("http://localhost:9999/", &api_config()).unwrap();
        assert_eq!(
            fetcher.report_url(14_000_000_000),
            "http://localhost:9999/Platform/Destiny2/Stats/PostGameCarnageReport/14000000000/"
        );
    }

    #[tokio::test]
    async fn test_sends_api_key_and_classifies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Platform/Destiny2/Stats/PostGameCarnageReport/5/"))
            .and(header("X-API-KEY", "test-key"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "ErrorCode": 1653,
                "ThrottleSeconds": 0,
                "ErrorStatus": "DestinyPGCRNotFound",
                "Message": "The activity you requested was not found."
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = ReportFetcher::with_base_url(&server.uri(), &api_config()).unwrap();
        let c = fetcher.fetch(5).await;
        assert_eq!(c.outcome, Outcome::NotFound);
    }

    #[tokio::test]
    async fn test_throttle_hint_closes_gate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "ErrorCode": 5,
                "ThrottleSeconds": 30,
                "ErrorStatus": "SystemDisabled",
                "Message": "Maintenance"
            })))
            .mount(&server)
            .await;

        let fetcher = ReportFetcher::with_base_url(&server.uri(), &api_config()).unwrap();
        let c = fetcher.fetch(6).await;
        assert_eq!(c.outcome, Outcome::UpstreamDisabled);
        assert!(fetcher.gate().remaining().unwrap() > Duration::from_secs(25));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let fetcher = ReportFetcher::with_base_url("http://127.0.0.1:1", &api_config()).unwrap();
        let c = fetcher.fetch(7).await;
        assert_eq!(c.outcome, Outcome::Transient);
        assert!(c.detail.is_some());
    }
}
