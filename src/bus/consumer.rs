//! Manual-ack consumer.
//!
//! One spawned task per consumer. Deliveries are handled strictly one at a
//! time: the next message is not pulled from the stream until the current
//! handler call has finished and the message has been settled.
//!
//! Settlement policy:
//! - handler `Ok`: ack
//! - handler `Err`, handler panic, undecodable body: nack without requeue

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::envelope::{EventEnvelope, Payload};
use super::topology::ExchangeBinding;
use super::{BrokerChannel, ChannelRole, Delivery, DeliveryStream, MessagingContext, Result};
use crate::materializer::MaterializeError;

/// Errors a handler reports back to the consumer. Any of them drops the message.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Handler for consumed events.
pub trait EventHandler: Send + Sync {
    /// Process one envelope. Returning `Err` rejects the message.
    fn handle(
        &self,
        envelope: Arc<EventEnvelope>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

/// Consumer lifecycle.
///
/// `NotStarted -> Starting -> Consuming -> Cancelling -> Stopped`, plus
/// `Consuming -> Stopped` when the connection goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    NotStarted,
    Starting,
    Consuming,
    Cancelling,
    Stopped,
}

/// Settlement counters.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    acked: AtomicU64,
    rejected: AtomicU64,
}

impl ConsumerStats {
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }
}

/// Starts consumers against a messaging context.
#[derive(Debug, Clone)]
pub struct Consumer {
    context: MessagingContext,
    prefetch: u16,
    tag_prefix: String,
}

impl Consumer {
    pub fn new(context: MessagingContext, prefetch: u16) -> Self {
        Self {
            context,
            prefetch,
            tag_prefix: "courier".to_string(),
        }
    }

    /// Prefix for broker consumer tags, usually the service name.
    pub fn with_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tag_prefix = prefix.into();
        self
    }

    /// Declare `binding` and start delivering its queue to `handler`.
    ///
    /// With a disabled context nothing is declared and the returned handle
    /// stays `NotStarted`.
    pub async fn start(
        &self,
        binding: &ExchangeBinding,
        handler: Arc<dyn EventHandler>,
    ) -> Result<ConsumerHandle> {
        if !self.context.is_active() {
            debug!(queue = %binding.queue, "Messaging disabled, consumer not started");
            return Ok(ConsumerHandle::inert(&binding.queue));
        }

        let (state, _) = watch::channel(ConsumerState::Starting);
        let state = Arc::new(state);

        let channel = self.context.open_channel(ChannelRole::Consume).await?;
        let tag = format!("{}-{}", self.tag_prefix, uuid::Uuid::new_v4());

        let stream = match Self::subscribe(channel.as_ref(), binding, &tag, self.prefetch).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "Error closing consume channel after failed start");
                }
                state.send_replace(ConsumerState::Stopped);
                return Err(e);
            }
        };

        state.send_replace(ConsumerState::Consuming);
        info!(
            queue = %binding.queue,
            consumer_tag = %tag,
            prefetch = self.prefetch,
            "Consumer started"
        );

        let stats = Arc::new(ConsumerStats::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            stream,
            handler,
            binding.queue.clone(),
            stop_rx,
            Arc::clone(&state),
            Arc::clone(&stats),
        ));

        Ok(ConsumerHandle {
            queue: binding.queue.clone(),
            tag: Some(tag),
            channel: Some(channel),
            state,
            stop: Some(stop_tx),
            task: Some(task),
            stats,
        })
    }

    async fn subscribe(
        channel: &dyn BrokerChannel,
        binding: &ExchangeBinding,
        tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        binding.declare(channel).await?;
        channel.consume(&binding.queue, tag, prefetch).await
    }
}

async fn run(
    mut stream: DeliveryStream,
    handler: Arc<dyn EventHandler>,
    queue: String,
    mut stop: watch::Receiver<bool>,
    state: Arc<watch::Sender<ConsumerState>>,
    stats: Arc<ConsumerStats>,
) {
    loop {
        // Processing happens outside the select so a stop request never
        // interrupts an in-flight handler.
        let next = tokio::select! {
            biased;
            _ = stop.changed() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => process(delivery, &handler, &queue, &stats).await,
            Some(Err(e)) => {
                error!(queue = %queue, error = %e, "Consumer delivery error");
                break;
            }
            None => {
                info!(queue = %queue, "Consumer stream ended");
                break;
            }
        }
    }

    // An explicit cancel owns the final transition.
    state.send_if_modified(|current| {
        if *current == ConsumerState::Consuming {
            *current = ConsumerState::Stopped;
            true
        } else {
            false
        }
    });
}

async fn process(
    delivery: Delivery,
    handler: &Arc<dyn EventHandler>,
    queue: &str,
    stats: &ConsumerStats,
) {
    let routing_key = delivery.routing_key.clone();

    let envelope = match EventEnvelope::<Payload>::from_slice(&delivery.body) {
        Ok(envelope) => Arc::new(envelope),
        Err(e) => {
            error!(
                queue = %queue,
                routing_key = %routing_key,
                error = %e,
                "Failed to decode envelope, dropping message"
            );
            reject(delivery, stats).await;
            return;
        }
    };

    let span = tracing::info_span!(
        "bus.consume",
        queue = %queue,
        routing_key = %routing_key,
        event_type = %envelope.event_type,
        redelivered = delivery.redelivered,
    );

    let outcome = AssertUnwindSafe(handler.handle(Arc::clone(&envelope)))
        .catch_unwind()
        .instrument(span)
        .await;

    match outcome {
        Ok(Ok(())) => match delivery.ack().await {
            Ok(()) => {
                stats.acked.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => error!(queue = %queue, error = %e, "Failed to ack message"),
        },
        Ok(Err(e)) => {
            error!(
                queue = %queue,
                event_type = %envelope.event_type,
                error = %e,
                "Handler failed, dropping message"
            );
            reject(delivery, stats).await;
        }
        Err(_) => {
            error!(
                queue = %queue,
                event_type = %envelope.event_type,
                "Handler panicked, dropping message"
            );
            reject(delivery, stats).await;
        }
    }
}

async fn reject(delivery: Delivery, stats: &ConsumerStats) {
    match delivery.nack(false).await {
        Ok(()) => {
            stats.rejected.fetch_add(1, Ordering::SeqCst);
        }
        Err(e) => error!(error = %e, "Failed to nack message"),
    }
}

/// A running (or never-started) consumer.
///
/// Dropping the handle stops delivery without closing the channel; call
/// [`ConsumerHandle::cancel`] for an orderly stop.
pub struct ConsumerHandle {
    queue: String,
    tag: Option<String>,
    channel: Option<Arc<dyn BrokerChannel>>,
    state: Arc<watch::Sender<ConsumerState>>,
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    stats: Arc<ConsumerStats>,
}

impl ConsumerHandle {
    fn inert(queue: &str) -> Self {
        let (state, _) = watch::channel(ConsumerState::NotStarted);
        Self {
            queue: queue.to_string(),
            tag: None,
            channel: None,
            state: Arc::new(state),
            stop: None,
            task: None,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    /// Stop delivery cooperatively.
    ///
    /// The broker consumer is cancelled first, the in-flight handler (if any)
    /// runs to completion and settles its message, then the channel is closed.
    /// Safe to call repeatedly.
    pub async fn cancel(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        self.state.send_if_modified(|current| {
            if *current == ConsumerState::Consuming {
                *current = ConsumerState::Cancelling;
                true
            } else {
                false
            }
        });

        if let (Some(channel), Some(tag)) = (&self.channel, &self.tag) {
            if let Err(e) = channel.cancel(tag).await {
                debug!(queue = %self.queue, error = %e, "Consumer cancel failed");
            }
        }

        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }

        if let Err(e) = task.await {
            warn!(queue = %self.queue, error = %e, "Consumer task ended abnormally");
        }

        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(queue = %self.queue, error = %e, "Consumer channel close failed");
            }
        }

        self.state.send_replace(ConsumerState::Stopped);
        info!(queue = %self.queue, "Consumer stopped");
    }
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("queue", &self.queue)
            .field("tag", &self.tag)
            .field("state", &self.state())
            .finish()
    }
}
