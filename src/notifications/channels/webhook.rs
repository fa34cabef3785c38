//! Webhook alert channel
//!
//! Posts alerts as JSON. The body carries both a plain `content` line and an
//! `embeds` array, which chat webhooks render and generic receivers can
//! ignore.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Channel, ChannelError, ChannelResult, DeliveryStatus};
use crate::notifications::Alert;

/// Webhook channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL endpoint
    pub url: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Maximum retry attempts on failure
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

fn default_timeout() -> u64 {
    10
}

fn default_retries() -> u32 {
    3
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_secs: default_timeout(),
            max_retries: default_retries(),
        }
    }

    /// Set max retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err("Webhook URL must start with http:// or https://".to_string());
        }

        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Webhook alert channel
///
/// # Payload Format
///
/// ```json
/// {
///   "content": "[WARNING] Gap mode entered: ...",
///   "embeds": [{
///     "title": "Gap mode entered",
///     "description": "Entering gap mode at instance ...",
///     "color": 15844367,
///     "timestamp": "2024-01-01T12:00:00Z",
///     "fields": [{ "name": "gap_start", "value": "14000000000", "inline": true }]
///   }],
///   "alert": { "id": "...", "kind": { "type": "gap_mode_entered", ... }, ... }
/// }
/// ```
pub struct WebhookChannel {
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> ChannelResult<Self> {
        config.validate().map_err(ChannelError::InvalidConfig)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    /// Create a webhook channel with default timeout and retries
    pub fn from_url(url: impl Into<String>) -> ChannelResult<Self> {
        Self::new(WebhookConfig::new(url))
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn build_payload(&self, alert: &Alert) -> serde_json::Value {
        let fields: Vec<_> = alert
            .metadata
            .iter()
            .map(|(name, value)| serde_json::json!({ "name": name, "value": value, "inline": true }))
            .collect();

        serde_json::json!({
            "content": alert.format_message(),
            "embeds": [{
                "title": alert.kind.title(),
                "description": alert.message,
                "color": alert.severity.color(),
                "timestamp": alert.created_at.to_rfc3339(),
                "fields": fields,
            }],
            "alert": alert,
        })
    }

    /// Send the request with retry logic
    async fn send_with_retry(&self, payload: &serde_json::Value) -> ChannelResult<()> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s...
                let delay = Duration::from_secs(2_u64.pow(attempt - 1));
                tokio::time::sleep(delay).await;
                tracing::debug!(
                    attempt = attempt + 1,
                    max_attempts = self.config.max_retries + 1,
                    "Retrying webhook request"
                );
            }

            match self.client.post(&self.config.url).json(payload).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    last_error = Some(ChannelError::Rejected {
                        status: status.as_u16(),
                        body,
                    });

                    // Don't retry on client errors (4xx)
                    if status.is_client_error() {
                        break;
                    }
                }
                Err(e) => last_error = Some(ChannelError::Http(e)),
            }
        }

        Err(last_error.unwrap_or_else(|| ChannelError::InvalidConfig("no attempts made".into())))
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> ChannelResult<DeliveryStatus> {
        let payload = self.build_payload(alert);

        match self.send_with_retry(&payload).await {
            Ok(()) => Ok(DeliveryStatus::success("webhook")),
            Err(e) => Ok(DeliveryStatus::failure("webhook", e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::AlertKind;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_webhook_config_validation() {
        assert!(WebhookConfig::new("https://example.com/webhook").validate().is_ok());
        assert!(WebhookConfig::new("").validate().is_err());
        assert!(WebhookConfig::new("example.com/webhook").validate().is_err());
        assert!(WebhookChannel::from_url("not-a-url").is_err());
    }

    #[test]
    fn test_webhook_payload_building() {
        let channel = WebhookChannel::from_url("https://example.com/webhook").unwrap();
        let alert = Alert::new(AlertKind::AccessRestricted { instance_id: 77 });

        let payload = channel.build_payload(&alert);

        assert_eq!(payload["embeds"][0]["title"], "Access restricted");
        assert_eq!(payload["embeds"][0]["fields"][0]["value"], "77");
        assert_eq!(payload["alert"]["severity"], "warning");
        assert!(payload["content"].as_str().unwrap().contains("77"));
    }

    #[tokio::test]
    async fn test_delivers_to_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "alert": { "kind": { "type": "startup", "cursor": 5 } }
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let channel = WebhookChannel::from_url(server.uri()).unwrap();
        let status = channel
            .send(&Alert::new(AlertKind::Startup { cursor: 5 }))
            .await
            .unwrap();
        assert!(status.success);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad payload"))
            .expect(1)
            .mount(&server)
            .await;

        let channel = WebhookChannel::from_url(server.uri()).unwrap();
        let status = channel
            .send(&Alert::new(AlertKind::Startup { cursor: 5 }))
            .await
            .unwrap();
        assert!(!status.success);
        assert!(status.message.unwrap().contains("bad payload"));
    }
}
