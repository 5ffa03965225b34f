//! In-process broker with AMQP semantics.
//!
//! Behaves like a single RabbitMQ node as far as this crate relies on it:
//! durable topic exchanges and queues, manual acknowledgement with prefetch,
//! nack with or without requeue, dead-letter exchanges, and unacked messages
//! returning to their queue when a channel or the connection goes away.
//!
//! Ideal for tests and for wiring several services into one process.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::topology::topic_matches;
use super::{
    Acknowledger, Broker, BrokerChannel, BusError, ChannelRole, ConnectionState, Delivery,
    DeliveryStream, Result,
};

/// In-memory broker. Clones share the same broker state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<BrokerState>,
    /// Bumped on every mutation so waiting consumers re-check their queue.
    changes: watch::Sender<u64>,
    connection: watch::Sender<ConnectionState>,
    /// Channels opened under an older generation belong to a dead connection.
    generation: AtomicU64,
    next_channel: AtomicU64,
    next_delivery_tag: AtomicU64,
}

impl Inner {
    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn connected(&self) -> bool {
        *self.connection.borrow() == ConnectionState::Connected
    }

    fn is_live(&self, generation: u64) -> bool {
        self.connected() && self.generation.load(Ordering::SeqCst) == generation
    }
}

#[derive(Default)]
struct BrokerState {
    /// exchange -> (queue, pattern) bindings
    exchanges: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, QueueState>,
    blocked: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    dead_letter_exchange: Option<String>,
    /// consumer tag -> owning channel
    consumers: HashMap<String, u64>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    message: StoredMessage,
    channel: u64,
}

impl BrokerState {
    /// Deliver to every queue with a matching binding. Unroutable messages are dropped.
    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> Result<usize> {
        let bindings = self.exchanges.get(exchange).ok_or_else(|| {
            BusError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let mut targets: Vec<String> = bindings
            .iter()
            .filter(|(_, pattern)| topic_matches(pattern, routing_key))
            .map(|(queue, _)| queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
            }
        }

        Ok(targets.len())
    }

    /// Return a channel's unacked messages to the head of their queues.
    fn release_channel(&mut self, channel: u64) {
        for queue in self.queues.values_mut() {
            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, unacked)| unacked.channel == channel)
                .map(|(tag, _)| *tag)
                .collect();
            let mut returned: Vec<(u64, StoredMessage)> = tags
                .into_iter()
                .filter_map(|tag| queue.unacked.remove(&tag).map(|u| (tag, u.message)))
                .collect();
            returned.sort_by_key(|(tag, _)| *tag);

            for (_, mut message) in returned.into_iter().rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }

            queue.consumers.retain(|_, owner| *owner != channel);
        }
    }

    fn release_all(&mut self) {
        let channels: Vec<u64> = self
            .queues
            .values()
            .flat_map(|q| q.unacked.values().map(|u| u.channel))
            .collect();
        for channel in channels {
            self.release_channel(channel);
        }
        for queue in self.queues.values_mut() {
            queue.consumers.clear();
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a connected broker with no exchanges or queues.
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        let (connection, _) = watch::channel(ConnectionState::Connected);

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                changes,
                connection,
                generation: AtomicU64::new(0),
                next_channel: AtomicU64::new(0),
                next_delivery_tag: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate a broker-initiated close. Unacked messages are requeued and
    /// every open channel dies with the connection.
    pub async fn disconnect(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.release_all();
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.connection.send_replace(ConnectionState::Disconnected);
        self.inner.notify();
        warn!("Memory broker connection closed");
    }

    /// Simulate flow control: while blocked, publishes are refused.
    pub async fn set_blocked(&self, blocked: bool) {
        self.inner.state.lock().await.blocked = blocked;
    }

    /// Messages waiting for delivery.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Messages delivered but not yet settled.
    pub async fn unacked_count(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    /// Active consumers on a queue.
    pub async fn consumer_count(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map(|q| q.consumers.len()).unwrap_or(0)
    }

    pub async fn has_exchange(&self, name: &str) -> bool {
        self.inner.state.lock().await.exchanges.contains_key(name)
    }

    pub async fn has_queue(&self, name: &str) -> bool {
        self.inner.state.lock().await.queues.contains_key(name)
    }

    /// Bindings from an exchange to queues.
    pub async fn binding_count(&self, exchange: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.exchanges.get(exchange).map(Vec::len).unwrap_or(0)
    }

    /// Poll one message with automatic acknowledgement (`basic.get`, no-ack).
    pub async fn get(&self, queue: &str) -> Option<Vec<u8>> {
        let mut state = self.inner.state.lock().await;
        let message = state.queues.get_mut(queue)?.ready.pop_front()?;
        drop(state);
        self.inner.notify();
        Some(message.body)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_channel(&self, role: ChannelRole) -> Result<Arc<dyn BrokerChannel>> {
        if !self.inner.connected() {
            return Err(BusError::Connection("Memory broker is not connected".to_string()));
        }

        let id = self.inner.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(channel = id, role = ?role, "Opened memory channel");

        Ok(Arc::new(MemoryChannel {
            inner: Arc::clone(&self.inner),
            id,
            generation: self.inner.generation.load(Ordering::SeqCst),
            role,
            closed: AtomicBool::new(false),
        }))
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.connected() {
            return Ok(());
        }
        {
            let mut state = self.inner.state.lock().await;
            state.release_all();
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.connection.send_replace(ConnectionState::Disconnected);
        self.inner.notify();
        info!("Memory broker connection closed by client");
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        if self.inner.connected() {
            return Ok(());
        }
        self.inner.connection.send_replace(ConnectionState::Connected);
        self.inner.notify();
        info!("Memory broker reconnected");
        Ok(())
    }
}

/// A channel on the memory broker.
struct MemoryChannel {
    inner: Arc<Inner>,
    id: u64,
    generation: u64,
    role: ChannelRole,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Channel(format!("Channel {} is closed", self.id)));
        }
        if !self.inner.is_live(self.generation) {
            return Err(BusError::Connection(
                "Connection closed underneath channel".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_role(&self, role: ChannelRole) -> Result<()> {
        if self.role != role {
            return Err(BusError::Channel(format!(
                "Channel {} is a {:?} channel, cannot be used for {:?}",
                self.id, self.role, role
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn role(&self) -> ChannelRole {
        self.role
    }

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;
        state.exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, name: &str, dead_letter_exchange: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;

        match state.queues.get(name) {
            Some(existing) if existing.dead_letter_exchange.as_deref() != dead_letter_exchange => {
                Err(BusError::Channel(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-exchange' for queue '{}'",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        dead_letter_exchange: dead_letter_exchange.map(str::to_string),
                        ..Default::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;

        if !state.queues.contains_key(queue) {
            return Err(BusError::Channel(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let bindings = state.exchanges.get_mut(exchange).ok_or_else(|| {
            BusError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let binding = (queue.to_string(), pattern.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        _content_type: &str,
    ) -> Result<bool> {
        self.ensure_open()?;
        self.ensure_role(ChannelRole::Publish)?;

        let routed = {
            let mut state = self.inner.state.lock().await;
            if state.blocked {
                return Ok(false);
            }
            state.route(
                exchange,
                routing_key,
                StoredMessage {
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    redelivered: false,
                },
            )?
        };

        debug!(exchange = %exchange, routing_key = %routing_key, queues = routed, "Routed message");
        self.inner.notify();
        Ok(true)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;
        self.ensure_role(ChannelRole::Consume)?;

        {
            let mut state = self.inner.state.lock().await;
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::Channel(format!("NOT_FOUND - no queue '{}'", queue)))?;
            if queue_state.consumers.contains_key(consumer_tag) {
                return Err(BusError::Channel(format!(
                    "NOT_ALLOWED - consumer tag '{}' already in use",
                    consumer_tag
                )));
            }
            queue_state.consumers.insert(consumer_tag.to_string(), self.id);
        }

        let cursor = Cursor {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            tag: consumer_tag.to_string(),
            channel: self.id,
            generation: self.generation,
            // prefetch 0 means unlimited in AMQP
            prefetch: if prefetch == 0 { usize::MAX } else { prefetch as usize },
            in_flight: Arc::new(AtomicUsize::new(0)),
            changes: self.inner.changes.subscribe(),
        };

        let stream = futures::stream::unfold(cursor, |mut cursor| async move {
            loop {
                let _ = cursor.changes.borrow_and_update();
                match cursor.poll().await {
                    Step::Ready(delivery) => return Some((Ok(delivery), cursor)),
                    Step::Finished => return None,
                    Step::Pending => {
                        if cursor.changes.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = self.inner.state.lock().await;
            for queue in state.queues.values_mut() {
                queue.consumers.remove(consumer_tag);
            }
        }
        self.inner.notify();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.is_live(self.generation) {
            let mut state = self.inner.state.lock().await;
            state.release_channel(self.id);
        }
        self.inner.notify();
        debug!(channel = self.id, "Closed memory channel");
        Ok(())
    }
}

enum Step {
    Ready(Delivery),
    Pending,
    Finished,
}

/// Per-consumer delivery state.
struct Cursor {
    inner: Arc<Inner>,
    queue: String,
    tag: String,
    channel: u64,
    generation: u64,
    prefetch: usize,
    in_flight: Arc<AtomicUsize>,
    changes: watch::Receiver<u64>,
}

impl Cursor {
    async fn poll(&self) -> Step {
        if !self.inner.is_live(self.generation) {
            return Step::Finished;
        }

        let mut state = self.inner.state.lock().await;
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Step::Finished;
        };
        if !queue.consumers.contains_key(&self.tag) {
            return Step::Finished;
        }
        if self.in_flight.load(Ordering::SeqCst) >= self.prefetch {
            return Step::Pending;
        }
        let Some(message) = queue.ready.pop_front() else {
            return Step::Pending;
        };

        let delivery_tag = self.inner.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
        queue.unacked.insert(
            delivery_tag,
            Unacked {
                message: message.clone(),
                channel: self.channel,
            },
        );
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let acker = MemoryAcker {
            inner: Arc::clone(&self.inner),
            queue: self.queue.clone(),
            delivery_tag,
            in_flight: Arc::clone(&self.in_flight),
        };

        Step::Ready(Delivery::new(
            message.routing_key,
            message.body,
            message.redelivered,
            Box::new(acker),
        ))
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    delivery_tag: u64,
    in_flight: Arc<AtomicUsize>,
}

impl MemoryAcker {
    /// `None` acks; `Some(requeue)` nacks.
    async fn settle(&self, requeue: Option<bool>) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;

            let (message, dead_letter_exchange) = {
                let queue = state.queues.get_mut(&self.queue).ok_or_else(|| {
                    BusError::Channel(format!("NOT_FOUND - no queue '{}'", self.queue))
                })?;
                let unacked = queue.unacked.remove(&self.delivery_tag).ok_or_else(|| {
                    BusError::Channel(format!(
                        "PRECONDITION_FAILED - unknown delivery tag {}",
                        self.delivery_tag
                    ))
                })?;
                (unacked.message, queue.dead_letter_exchange.clone())
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match requeue {
                None => {}
                Some(true) => {
                    if let Some(queue) = state.queues.get_mut(&self.queue) {
                        queue.ready.push_front(StoredMessage {
                            redelivered: true,
                            ..message
                        });
                    }
                }
                Some(false) => {
                    if let Some(dlx) = dead_letter_exchange {
                        let routing_key = message.routing_key.clone();
                        if let Err(e) = state.route(
                            &dlx,
                            &routing_key,
                            StoredMessage {
                                redelivered: false,
                                ..message
                            },
                        ) {
                            warn!(error = %e, dead_letter_exchange = %dlx, "Dead-lettering failed");
                        }
                    }
                }
            }
        }

        self.inner.notify();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(None).await
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue)).await
    }
}
