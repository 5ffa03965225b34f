//! Messaging capability handed to publishers and consumers.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Broker, BrokerChannel, BusError, ChannelRole, ConnectionState, Result};
use crate::config::MessagingConfig;

/// Either a live broker connection or an explicit "messaging is off".
///
/// Owned by the lifecycle controller and cloned into every publisher and
/// consumer. Cloning shares the underlying connection.
#[derive(Clone)]
pub enum MessagingContext {
    Active(Arc<dyn Broker>),
    Disabled,
}

impl MessagingContext {
    /// Build the context described by `config`.
    ///
    /// - no URL, messaging optional: `Disabled`
    /// - no URL, messaging required: `BusError::Configuration`
    /// - URL: connect, failing with `BusError::Connection`
    pub async fn connect(config: &MessagingConfig) -> Result<Self> {
        let Some(url) = config.effective_url() else {
            if config.required {
                return Err(BusError::Configuration(
                    "messaging.url is required but not set".to_string(),
                ));
            }
            info!("No broker URL configured, messaging disabled");
            return Ok(Self::Disabled);
        };

        Self::connect_url(url, config).await
    }

    #[cfg(feature = "amqp")]
    async fn connect_url(url: &str, config: &MessagingConfig) -> Result<Self> {
        let broker = super::AmqpBroker::connect(url, config.connect_timeout()).await?;
        Ok(Self::Active(Arc::new(broker)))
    }

    #[cfg(not(feature = "amqp"))]
    async fn connect_url(url: &str, _config: &MessagingConfig) -> Result<Self> {
        Err(BusError::Configuration(format!(
            "Broker URL {} configured but the amqp feature is not enabled",
            super::redact_url(url)
        )))
    }

    /// Wrap an already-connected broker.
    pub fn active(broker: Arc<dyn Broker>) -> Self {
        Self::Active(broker)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    /// Connection state. A disabled context is permanently disconnected.
    pub fn state(&self) -> ConnectionState {
        match self {
            Self::Active(broker) => broker.state(),
            Self::Disabled => ConnectionState::Disconnected,
        }
    }

    pub fn broker(&self) -> Option<&Arc<dyn Broker>> {
        match self {
            Self::Active(broker) => Some(broker),
            Self::Disabled => None,
        }
    }

    /// Open a channel for `role`. Fails with `BusError::Disabled` when off.
    pub async fn open_channel(&self, role: ChannelRole) -> Result<Arc<dyn BrokerChannel>> {
        match self {
            Self::Active(broker) => broker.open_channel(role).await,
            Self::Disabled => Err(BusError::Disabled),
        }
    }

    /// Close the connection. No-op when disabled or already closed.
    pub async fn close(&self) -> Result<()> {
        match self {
            Self::Active(broker) => {
                if let Err(e) = broker.close().await {
                    warn!(error = %e, "Error closing broker connection");
                    return Err(e);
                }
                Ok(())
            }
            Self::Disabled => {
                debug!("Messaging disabled, nothing to close");
                Ok(())
            }
        }
    }
}

impl fmt::Debug for MessagingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active(broker) => f
                .debug_tuple("Active")
                .field(&broker.state())
                .finish(),
            Self::Disabled => f.write_str("Disabled"),
        }
    }
}
