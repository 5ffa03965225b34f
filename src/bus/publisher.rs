//! Fire-and-forget publisher.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::envelope::{EventEnvelope, CONTENT_TYPE};
use super::{BrokerChannel, BusError, ChannelRole, ConnectionState, MessagingContext, Result};

/// Publishes envelopes on a dedicated publish channel.
///
/// `publish` never fails the caller: it reports whether the broker accepted
/// the message and logs anything else. Rejected messages are not retried or
/// buffered locally.
pub struct Publisher {
    context: MessagingContext,
    exchanges: Vec<String>,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    timeout: Duration,
}

impl Publisher {
    /// Open the publish channel and declare `exchanges`.
    ///
    /// With a disabled context this performs no I/O and every publish is a
    /// logged no-op.
    pub async fn open(
        context: MessagingContext,
        exchanges: &[&str],
        timeout: Duration,
    ) -> Result<Self> {
        let publisher = Self {
            context,
            exchanges: exchanges.iter().map(|e| e.to_string()).collect(),
            channel: RwLock::new(None),
            timeout,
        };

        if publisher.context.is_active() {
            publisher.reopen().await?;
        }

        Ok(publisher)
    }

    /// A publisher that drops everything.
    pub fn disabled() -> Self {
        Self {
            context: MessagingContext::Disabled,
            exchanges: Vec::new(),
            channel: RwLock::new(None),
            timeout: Duration::ZERO,
        }
    }

    /// Open a fresh channel and redeclare exchanges. Used at startup and after
    /// the connection has been re-established.
    pub async fn reopen(&self) -> Result<()> {
        let channel = self.context.open_channel(ChannelRole::Publish).await?;
        for exchange in &self.exchanges {
            channel.declare_exchange(exchange).await?;
        }

        if let Some(previous) = self.channel.write().await.replace(channel) {
            if let Err(e) = previous.close().await {
                debug!(error = %e, "Error closing previous publish channel");
            }
        }

        info!(exchanges = ?self.exchanges, "Publisher ready");
        Ok(())
    }

    /// Publish `envelope`, surfacing every failure.
    pub async fn try_publish<P: Serialize + Sync>(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &EventEnvelope<P>,
    ) -> Result<()> {
        if !self.context.is_active() {
            return Err(BusError::Disabled);
        }
        if self.context.state() != ConnectionState::Connected {
            return Err(BusError::Connection("broker connection is down".to_string()));
        }

        let channel = self
            .channel
            .read()
            .await
            .clone()
            .ok_or_else(|| BusError::Channel("publish channel is not open".to_string()))?;

        let body = envelope.to_bytes()?;

        let publish = channel.publish(exchange, routing_key, &body, CONTENT_TYPE);
        match tokio::time::timeout(self.timeout, publish).await {
            Err(_) => Err(BusError::Timeout(self.timeout)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(false)) => Err(BusError::PublishRejected {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            }),
            Ok(Ok(true)) => Ok(()),
        }
    }

    /// Publish `envelope` and report whether the broker accepted it.
    pub async fn publish<P: Serialize + Sync>(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &EventEnvelope<P>,
    ) -> bool {
        match self.try_publish(exchange, routing_key, envelope).await {
            Ok(()) => {
                debug!(exchange = %exchange, routing_key = %routing_key, "Published event");
                true
            }
            Err(BusError::Disabled) => {
                debug!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    "Messaging disabled, skipping publish"
                );
                false
            }
            Err(e @ BusError::PublishRejected { .. }) | Err(e @ BusError::Connection(_)) => {
                warn!(error = %e, "Event not published");
                false
            }
            Err(e) => {
                error!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    error = %e,
                    "Failed to publish event"
                );
                false
            }
        }
    }

    /// Publish using the envelope's event type as routing key.
    pub async fn publish_event<P: Serialize + Sync>(
        &self,
        exchange: &str,
        envelope: &EventEnvelope<P>,
    ) -> bool {
        self.publish(exchange, &envelope.event_type, envelope).await
    }

    /// Close the publish channel. Later publishes report `false`.
    pub async fn close(&self) {
        if let Some(channel) = self.channel.write().await.take() {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Error closing publish channel");
            }
        }
    }
}
