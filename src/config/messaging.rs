//! Messaging configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Broker connection and delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// AMQP connection URL. Empty or absent means "not configured".
    pub url: Option<String>,
    /// Fail startup when no URL is configured instead of disabling messaging.
    pub required: bool,
    /// Bound on establishing the broker connection.
    pub connect_timeout_ms: u64,
    /// Bound on a single publish, including its broker confirmation.
    pub publish_timeout_ms: u64,
    /// Unacknowledged deliveries allowed per consumer.
    pub prefetch: u16,
    /// Exchange receiving messages rejected without requeue.
    pub dead_letter_exchange: Option<String>,
    /// Reconnect supervisor.
    pub reconnect: ReconnectConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            url: None,
            required: false,
            connect_timeout_ms: 5_000,
            publish_timeout_ms: 5_000,
            prefetch: 1,
            dead_letter_exchange: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl MessagingConfig {
    /// Config pointing at `url`, messaging required.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            required: true,
            ..Default::default()
        }
    }

    /// The configured URL, treating an empty string as absent.
    pub fn effective_url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|url| !url.is_empty())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Exponential backoff bounds for the reconnect supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Off by default: a lost connection stays lost until restart.
    pub enabled: bool,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}
