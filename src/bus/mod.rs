//! Event bus for asynchronous identity propagation.
//!
//! This module contains:
//! - `Broker` / `BrokerChannel` traits: one connection per process, one channel per role
//! - `Delivery`: a received message under manual acknowledgement
//! - `MessagingContext`: `Active(broker)` or `Disabled`
//! - `Publisher` and `Consumer` built on top of the context
//! - Implementations: AMQP (RabbitMQ), in-process memory broker

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::watch;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

pub mod consumer;
pub mod context;
pub mod envelope;
pub mod publisher;
pub mod topology;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use consumer::{Consumer, ConsumerHandle, ConsumerState, EventHandler, HandlerError};
pub use context::MessagingContext;
pub use envelope::{EventEnvelope, EventMetadata, Payload, CONTENT_TYPE};
pub use memory::MemoryBroker;
pub use publisher::Publisher;
pub use topology::ExchangeBinding;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Publish rejected by broker (exchange={exchange}, routing_key={routing_key})")]
    PublishRejected {
        exchange: String,
        routing_key: String,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Messaging is disabled")]
    Disabled,
}

// ============================================================================
// Connection state
// ============================================================================

/// Process-wide broker connection state.
///
/// `Connected -> Disconnected` happens on broker-initiated close or a
/// connection error. Nothing moves it back except an explicit reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// What a channel is used for. Fixed for the channel's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Publish,
    Consume,
}

// ============================================================================
// Traits
// ============================================================================

/// A single logical connection to a message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new channel dedicated to `role`.
    async fn open_channel(&self, role: ChannelRole) -> Result<Arc<dyn BrokerChannel>>;

    /// Watch connection state transitions.
    fn subscribe_state(&self) -> watch::Receiver<ConnectionState>;

    /// Current connection state.
    fn state(&self) -> ConnectionState {
        *self.subscribe_state().borrow()
    }

    /// Close the connection. Safe to call when already closed.
    async fn close(&self) -> Result<()>;

    /// Re-establish a lost connection. Only the lifecycle supervisor calls this.
    async fn reconnect(&self) -> Result<()>;
}

/// A multiplexed session over a broker connection.
///
/// Declarations are idempotent: redeclaring an entity with identical
/// parameters is a no-op.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// The role this channel was opened for.
    fn role(&self) -> ChannelRole;

    /// Declare a durable topic exchange.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Declare a durable queue, optionally dead-lettering rejected messages.
    async fn declare_queue(&self, name: &str, dead_letter_exchange: Option<&str>) -> Result<()>;

    /// Bind `queue` to `exchange` with a topic routing pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Publish a persistent message.
    ///
    /// Returns `false` when the broker refused the message into its buffers.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<bool>;

    /// Start a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16)
        -> Result<DeliveryStream>;

    /// Stop delivery to `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Close the channel. Safe to call when already closed.
    async fn close(&self) -> Result<()>;
}

/// Stream of deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message received under manual acknowledgement.
///
/// Settling consumes the delivery, so each message is acked or nacked once.
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            redelivered,
            acker,
        }
    }

    /// Remove the message from its queue.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the message, optionally returning it to the queue.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Strip credentials from a broker URL for logging.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    // credentials can only appear in the authority
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***@{}", &url[..scheme_end], &rest[at + 1..]),
        None => url.to_string(),
    }
}
