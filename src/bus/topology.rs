//! Exchange/queue topology shared by every service in the propagation chain.
//!
//! Names here are wire contracts. Changing one is a breaking schema change
//! that needs a dual-publish/dual-consume migration.

use tracing::info;

use super::{BrokerChannel, Result};

/// Exchange the identity-issuing service publishes to.
pub const IDENTITY_EVENTS_EXCHANGE: &str = "identity.events";
/// A user registered with the identity service.
pub const IDENTITY_REGISTERED: &str = "identity.registered";

/// Exchange the relay publishes materialized identities to.
pub const DIRECTORY_EVENTS_EXCHANGE: &str = "directory.events";
/// The relay has materialized an identity into its directory.
pub const IDENTITY_MATERIALIZED: &str = "identity.materialized";

/// Relay queue bound to `identity.registered`.
pub const DIRECTORY_QUEUE: &str = "directory.identity-events";
/// Downstream cache queue bound to `identity.materialized`.
pub const CACHE_QUEUE: &str = "cache.directory-events";

/// Declarative `(exchange, topic, durable) x (queue, durable) x pattern` relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_pattern: String,
    /// Exchange that receives messages rejected without requeue.
    pub dead_letter_exchange: Option<String>,
}

impl ExchangeBinding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_pattern: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_pattern: routing_pattern.into(),
            dead_letter_exchange: None,
        }
    }

    /// Relay hop: identity registrations into the directory queue.
    pub fn directory() -> Self {
        Self::new(IDENTITY_EVENTS_EXCHANGE, DIRECTORY_QUEUE, IDENTITY_REGISTERED)
    }

    /// Cache hop: materialized identities into the cache queue.
    pub fn cache() -> Self {
        Self::new(DIRECTORY_EVENTS_EXCHANGE, CACHE_QUEUE, IDENTITY_MATERIALIZED)
    }

    pub fn with_dead_letter_exchange(mut self, exchange: Option<String>) -> Self {
        self.dead_letter_exchange = exchange;
        self
    }

    /// Declare exchange, queue and binding. Idempotent; run on every start.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<()> {
        channel.declare_exchange(&self.exchange).await?;

        if let Some(dlx) = &self.dead_letter_exchange {
            channel.declare_exchange(dlx).await?;
        }

        channel
            .declare_queue(&self.queue, self.dead_letter_exchange.as_deref())
            .await?;
        channel
            .bind_queue(&self.queue, &self.exchange, &self.routing_pattern)
            .await?;

        info!(
            exchange = %self.exchange,
            queue = %self.queue,
            routing_pattern = %self.routing_pattern,
            dead_letter_exchange = ?self.dead_letter_exchange,
            "Bound queue to exchange"
        );

        Ok(())
    }
}

/// Match a routing key against an AMQP topic pattern.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && words_match(rest, tail),
            None => false,
        },
    }
}
