//! Delivery guarantee step definitions.
//!
//! Wires the relay and the cache consumer over one in-process broker:
//! identity.events -> relay -> directory.events -> cache.

use std::sync::Arc;
use std::time::Duration;

use courier::bus::topology::{
    DIRECTORY_EVENTS_EXCHANGE, DIRECTORY_QUEUE, IDENTITY_EVENTS_EXCHANGE, IDENTITY_MATERIALIZED,
    IDENTITY_REGISTERED,
};
use courier::bus::{
    Broker, ChannelRole, Consumer, ConsumerHandle, ConsumerState, EventEnvelope,
    ExchangeBinding, MemoryBroker, MessagingContext, Publisher, CONTENT_TYPE,
};
use courier::handlers::MaterializeHandler;
use courier::materializer::{IdentityMaterializer, IdentityRecord};
use courier::storage::{IdentityStore, MemoryIdentityStore};
use cucumber::{given, then, when, World};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(3);

/// Test context for delivery scenarios.
#[derive(World)]
#[world(init = Self::new)]
pub struct DeliveryWorld {
    broker: MemoryBroker,
    context: MessagingContext,
    directory: Arc<MemoryIdentityStore>,
    cache: Arc<MemoryIdentityStore>,
    publisher: Option<Publisher>,
    relay: Option<ConsumerHandle>,
    cache_consumer: Option<ConsumerHandle>,
    accepted: Vec<bool>,
}

impl std::fmt::Debug for DeliveryWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryWorld")
            .field("context", &self.context)
            .field("relay", &self.relay)
            .field("cache_consumer", &self.cache_consumer)
            .field("accepted", &self.accepted)
            .finish()
    }
}

impl DeliveryWorld {
    fn new() -> Self {
        let broker = MemoryBroker::new();
        Self {
            context: MessagingContext::active(Arc::new(broker.clone())),
            broker,
            directory: Arc::new(MemoryIdentityStore::new()),
            cache: Arc::new(MemoryIdentityStore::new()),
            publisher: None,
            relay: None,
            cache_consumer: None,
            accepted: Vec::new(),
        }
    }

    async fn start_chain(&mut self) {
        let consumer = Consumer::new(self.context.clone(), 1);

        let onward = Publisher::open(
            self.context.clone(),
            &[DIRECTORY_EVENTS_EXCHANGE],
            Duration::from_secs(1),
        )
        .await
        .expect("open onward publisher");
        let relay = MaterializeHandler::new(
            IDENTITY_REGISTERED,
            IdentityMaterializer::new(self.directory.clone()),
        )
        .with_onward(Arc::new(onward), DIRECTORY_EVENTS_EXCHANGE, IDENTITY_MATERIALIZED);
        let cache = MaterializeHandler::new(
            IDENTITY_MATERIALIZED,
            IdentityMaterializer::new(self.cache.clone()),
        );

        self.relay = Some(
            consumer
                .start(&ExchangeBinding::directory(), Arc::new(relay))
                .await
                .expect("start relay"),
        );
        self.cache_consumer = Some(
            consumer
                .start(&ExchangeBinding::cache(), Arc::new(cache))
                .await
                .expect("start cache consumer"),
        );
        self.publisher = Some(
            Publisher::open(
                self.context.clone(),
                &[IDENTITY_EVENTS_EXCHANGE],
                Duration::from_secs(1),
            )
            .await
            .expect("open publisher"),
        );
    }

    fn relay(&self) -> &ConsumerHandle {
        self.relay.as_ref().expect("relay not started")
    }

    async fn register(&mut self, id: &str, email: &str, display_name: &str) {
        let payload = json!({"id": id, "email": email, "displayName": display_name});
        let envelope =
            EventEnvelope::new(IDENTITY_REGISTERED, payload.as_object().cloned().unwrap_or_default());
        let publisher = self.publisher.as_ref().expect("publisher not opened");
        let accepted = publisher
            .publish_event(IDENTITY_EVENTS_EXCHANGE, &envelope)
            .await;
        self.accepted.push(accepted);
    }

    /// Wait until the relay has settled `count` deliveries.
    async fn settled(&self, count: u64) {
        let relay = self.relay();
        tokio::time::timeout(WAIT, async {
            while relay.stats().acked() + relay.stats().rejected() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("relay did not settle in time");
    }

    /// Wait until the cache copy of `id` carries `email`.
    async fn cached(&self, id: &str, email: &str) -> IdentityRecord {
        tokio::time::timeout(WAIT, async {
            loop {
                let found = self.cache.find_by_id(id).await.expect("cache lookup");
                if let Some(record) = found.filter(|r| r.email == email) {
                    break record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{id} never reached the cache with {email}"))
    }
}

// ==========================================================================
// Background
// ==========================================================================

#[given("a running propagation chain")]
async fn given_running_chain(world: &mut DeliveryWorld) {
    world.start_chain().await;
}

#[given("messaging is disabled")]
async fn given_messaging_disabled(world: &mut DeliveryWorld) {
    world.context = MessagingContext::Disabled;
    world.start_chain().await;
}

#[given("the directory store is unavailable")]
async fn given_directory_unavailable(world: &mut DeliveryWorld) {
    world.directory.set_unavailable(true).await;
}

// ==========================================================================
// Actions
// ==========================================================================

#[when(expr = "identity {string} registers with email {string} and name {string}")]
async fn when_identity_registers(
    world: &mut DeliveryWorld,
    id: String,
    email: String,
    display_name: String,
) {
    world.register(&id, &email, &display_name).await;
}

#[when(expr = "identity {string} registers again with email {string} and name {string}")]
async fn when_identity_registers_again(
    world: &mut DeliveryWorld,
    id: String,
    email: String,
    display_name: String,
) {
    world.register(&id, &email, &display_name).await;
}

#[when("a malformed message is published to the identity exchange")]
async fn when_malformed_message(world: &mut DeliveryWorld) {
    let channel = world
        .broker
        .open_channel(ChannelRole::Publish)
        .await
        .expect("open channel");
    let accepted = channel
        .publish(
            IDENTITY_EVENTS_EXCHANGE,
            IDENTITY_REGISTERED,
            b"{not json",
            CONTENT_TYPE,
        )
        .await
        .expect("publish");
    world.accepted.push(accepted);
}

// ==========================================================================
// Outcomes
// ==========================================================================

#[then(expr = "the cache holds {string} with email {string}")]
async fn then_cache_holds(world: &mut DeliveryWorld, id: String, email: String) {
    let record = world.cached(&id, &email).await;

    let directory = world
        .directory
        .find_by_id(&id)
        .await
        .expect("directory lookup")
        .expect("directory copy");
    assert_eq!(record, directory, "cache must mirror the directory");
}

#[then(expr = "the cache holds {int} identity/identities")]
async fn then_cache_count(world: &mut DeliveryWorld, count: usize) {
    assert_eq!(world.cache.len().await, count);
}

#[then(expr = "the relay settles {int} delivery/deliveries")]
async fn then_relay_settles(world: &mut DeliveryWorld, count: u64) {
    world.settled(count).await;
}

#[then(expr = "the relay acknowledged {int} and rejected {int}")]
async fn then_relay_counts(world: &mut DeliveryWorld, acked: u64, rejected: u64) {
    let stats = world.relay().stats();
    assert_eq!(stats.acked(), acked);
    assert_eq!(stats.rejected(), rejected);
}

#[then("nothing is left on the directory queue")]
async fn then_directory_queue_empty(world: &mut DeliveryWorld) {
    // a requeued message would show up here again
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(world.broker.queue_depth(DIRECTORY_QUEUE).await, 0);
    assert_eq!(world.broker.unacked_count(DIRECTORY_QUEUE).await, 0);
}

#[then("the cache stays empty")]
async fn then_cache_empty(world: &mut DeliveryWorld) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(world.cache.is_empty().await);
}

#[then("the publish is reported as not delivered")]
async fn then_publish_not_delivered(world: &mut DeliveryWorld) {
    assert_eq!(world.accepted.last(), Some(&false));
}

#[then("no consumer is started")]
async fn then_no_consumer(world: &mut DeliveryWorld) {
    assert_eq!(world.relay().state(), ConsumerState::NotStarted);
    assert_eq!(
        world
            .cache_consumer
            .as_ref()
            .expect("cache consumer handle")
            .state(),
        ConsumerState::NotStarted
    );
    assert!(!world.broker.has_queue(DIRECTORY_QUEUE).await);
}
