//! Alert fan-out with per-kind rate limiting

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::channels::webhook::WebhookChannel;
use super::channels::{Channel, ChannelResult};
use super::{Alert, AlertKind, AlertSeverity};
use crate::config::AlertConfig;

/// Formats events into alerts and delivers them to every channel
///
/// Every alert is logged. Per-id kinds share a token bucket per kind so a
/// burst of misses cannot flood the channels; dropped alerts are still
/// logged.
pub struct Alerter {
    channels: Vec<Arc<dyn Channel>>,
    limiter: DefaultKeyedRateLimiter<&'static str>,
}

impl Alerter {
    /// `burst` rate-limited alerts per kind within `window`
    pub fn new(burst: u32, window: Duration) -> Self {
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(window / burst.get())
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);

        Self {
            channels: Vec::new(),
            limiter: RateLimiter::keyed(quota),
        }
    }

    /// Build from configuration, with a webhook channel when one is set
    pub fn from_config(config: &AlertConfig) -> ChannelResult<Self> {
        let mut alerter = Self::new(
            config.miss_alert_burst,
            Duration::from_secs(config.miss_alert_window_secs),
        );
        if let Some(url) = config.webhook_url.as_deref().filter(|u| !u.is_empty()) {
            alerter.add_channel(Arc::new(WebhookChannel::from_url(url)?));
        }
        Ok(alerter)
    }

    /// Alerter that only logs
    pub fn disabled() -> Self {
        let config = AlertConfig::default();
        Self::new(
            config.miss_alert_burst,
            Duration::from_secs(config.miss_alert_window_secs),
        )
    }

    pub fn add_channel(&mut self, channel: Arc<dyn Channel>) {
        self.channels.push(channel);
    }

    /// Log the alert and decide whether it goes out
    fn admit(&self, kind: &AlertKind) -> Option<Alert> {
        let alert = Alert::new(kind.clone());
        let text = alert.format_message();
        match alert.severity {
            AlertSeverity::Info => tracing::info!(alert = kind.key(), "{text}"),
            AlertSeverity::Warning => tracing::warn!(alert = kind.key(), "{text}"),
            AlertSeverity::Critical => tracing::error!(alert = kind.key(), "{text}"),
        }

        if self.channels.is_empty() {
            return None;
        }
        if kind.is_rate_limited() && self.limiter.check_key(&kind.key()).is_err() {
            tracing::debug!(alert = kind.key(), "Alert rate limited");
            return None;
        }
        Some(alert)
    }

    /// Deliver an alert and wait for every channel
    pub async fn send(&self, kind: AlertKind) {
        if let Some(alert) = self.admit(&kind) {
            deliver(&self.channels, &alert).await;
        }
    }

    /// Deliver an alert in the background
    pub fn notify(&self, kind: AlertKind) {
        if let Some(alert) = self.admit(&kind) {
            let channels = self.channels.clone();
            tokio::spawn(async move { deliver(&channels, &alert).await });
        }
    }
}

async fn deliver(channels: &[Arc<dyn Channel>], alert: &Alert) {
    for channel in channels {
        match channel.send(alert).await {
            Ok(status) if status.success => {}
            Ok(status) => tracing::error!(%status, "Failed to deliver alert"),
            Err(e) => tracing::error!(channel = channel.name(), error = %e, "Failed to deliver alert"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::channels::DeliveryStatus;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Channel for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn send(&self, alert: &Alert) -> ChannelResult<DeliveryStatus> {
            self.sent.lock().unwrap().push(alert.kind.key().to_string());
            Ok(DeliveryStatus::success("recorder"))
        }
    }

    #[tokio::test]
    async fn test_rate_limits_miss_alerts_only() {
        let recorder = Arc::new(Recorder::default());
        let mut alerter = Alerter::new(2, Duration::from_secs(60));
        alerter.add_channel(recorder.clone());

        for id in 0..5 {
            alerter
                .send(AlertKind::PermanentMiss {
                    instance_id: id,
                    gap: false,
                })
                .await;
        }
        for _ in 0..3 {
            alerter.send(AlertKind::Startup { cursor: 1 }).await;
        }

        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent.iter().filter(|k| *k == "permanent_miss").count(), 2);
        assert_eq!(sent.iter().filter(|k| *k == "startup").count(), 3);
    }

    #[tokio::test]
    async fn test_kinds_have_separate_buckets() {
        let recorder = Arc::new(Recorder::default());
        let mut alerter = Alerter::new(1, Duration::from_secs(60));
        alerter.add_channel(recorder.clone());

        alerter.send(AlertKind::AccessRestricted { instance_id: 1 }).await;
        alerter.send(AlertKind::AccessRestricted { instance_id: 2 }).await;
        alerter
            .send(AlertKind::OffloadWarning {
                instance_id: 3,
                attempt: 3,
            })
            .await;

        assert_eq!(recorder.sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_from_config_without_webhook() {
        let alerter = Alerter::from_config(&AlertConfig::default()).unwrap();
        assert!(alerter.channels.is_empty());

        let bad = AlertConfig {
            webhook_url: Some("ftp://nope".into()),
            ..AlertConfig::default()
        };
        assert!(Alerter::from_config(&bad).is_err());
    }
}
