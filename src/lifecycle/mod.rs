//! Process-level start/stop orchestration for messaging.
//!
//! The lifecycle controller owns the broker connection (through the
//! [`MessagingContext`]), every publisher it hands out and every consumer it
//! starts. Boot order: connect, declare topology, start consumers. Shutdown
//! order is the reverse: consumers drain, publish channels close, the
//! connection closes last.
//!
//! A lost connection stays lost unless the reconnect supervisor is enabled
//! (`messaging.reconnect.enabled`). The supervisor reconnects with
//! exponential backoff, reopens publish channels, re-declares topology and
//! restarts every consumer. Publishers and consumers never reconnect on their
//! own.

use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{
    Broker, ConnectionState, Consumer, ConsumerHandle, ConsumerState, EventHandler,
    ExchangeBinding, MessagingContext, Publisher, Result,
};
use crate::config::{Config, MessagingConfig, ReconnectConfig};

/// A started consumer plus what is needed to start it again.
struct Subscription {
    binding: ExchangeBinding,
    handler: Arc<dyn EventHandler>,
    handle: ConsumerHandle,
}

/// State shared with the reconnect supervisor.
struct Shared {
    context: MessagingContext,
    consumer: Consumer,
    publishers: Mutex<Vec<Arc<Publisher>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Shared {
    /// Bring messaging back after the connection was lost.
    async fn restore(&self, broker: &dyn Broker) -> Result<()> {
        broker.reconnect().await?;

        for publisher in self.publishers.lock().await.iter() {
            publisher.reopen().await?;
        }

        for subscription in self.subscriptions.lock().await.iter_mut() {
            subscription.handle.cancel().await;
            subscription.handle = self
                .consumer
                .start(&subscription.binding, Arc::clone(&subscription.handler))
                .await?;
        }

        Ok(())
    }
}

struct Supervisor {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Lifecycle controller for one process.
pub struct Lifecycle {
    shared: Arc<Shared>,
    messaging: MessagingConfig,
    supervisor: Mutex<Option<Supervisor>>,
}

impl Lifecycle {
    /// Build the messaging context from configuration.
    ///
    /// Fails with `BusError::Configuration` when a required URL is missing and
    /// with `BusError::Connection` when the broker is
    /// unreachable. Nothing is declared before the connection exists.
    pub async fn connect(config: &Config) -> Result<Self> {
        let context = MessagingContext::connect(&config.messaging).await?;
        Ok(Self::new(context, config))
    }

    /// Wrap an existing context.
    pub fn new(context: MessagingContext, config: &Config) -> Self {
        let consumer = Consumer::new(context.clone(), config.messaging.prefetch)
            .with_tag_prefix(config.service.name.clone());

        info!(
            service = %config.service.name,
            context = ?context,
            "Messaging lifecycle initialised"
        );

        Self {
            shared: Arc::new(Shared {
                context,
                consumer,
                publishers: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
            messaging: config.messaging.clone(),
            supervisor: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &MessagingContext {
        &self.shared.context
    }

    /// Open a publisher that declares `exchanges`.
    pub async fn publisher(&self, exchanges: &[&str]) -> Result<Arc<Publisher>> {
        let publisher = Arc::new(
            Publisher::open(
                self.shared.context.clone(),
                exchanges,
                self.messaging.publish_timeout(),
            )
            .await?,
        );
        self.shared
            .publishers
            .lock()
            .await
            .push(Arc::clone(&publisher));
        Ok(publisher)
    }

    /// Declare `binding` and start consuming it with `handler`.
    ///
    /// The configured dead-letter exchange applies when the binding does not
    /// name one.
    pub async fn subscribe(
        &self,
        binding: ExchangeBinding,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        let binding = if binding.dead_letter_exchange.is_none() {
            binding.with_dead_letter_exchange(self.messaging.dead_letter_exchange.clone())
        } else {
            binding
        };

        let handle = self
            .shared
            .consumer
            .start(&binding, Arc::clone(&handler))
            .await?;

        self.shared.subscriptions.lock().await.push(Subscription {
            binding,
            handler,
            handle,
        });
        Ok(())
    }

    /// Queue name and state of every consumer.
    pub async fn consumer_states(&self) -> Vec<(String, ConsumerState)> {
        self.shared
            .subscriptions
            .lock()
            .await
            .iter()
            .map(|s| (s.handle.queue().to_string(), s.handle.state()))
            .collect()
    }

    /// Start the reconnect supervisor if configured. Returns whether it runs.
    pub async fn supervise(&self) -> bool {
        if !self.messaging.reconnect.enabled {
            debug!("Reconnect supervisor disabled");
            return false;
        }
        let Some(broker) = self.shared.context.broker().cloned() else {
            debug!("Messaging disabled, no reconnect supervisor");
            return false;
        };

        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            return true;
        }

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(supervise_connection(
            Arc::clone(&self.shared),
            broker,
            self.messaging.reconnect.clone(),
            stop_rx,
        ));
        *supervisor = Some(Supervisor { stop, task });

        info!(
            min_delay_ms = self.messaging.reconnect.min_delay_ms,
            max_delay_ms = self.messaging.reconnect.max_delay_ms,
            "Reconnect supervisor started"
        );
        true
    }

    /// Drain and close everything. Errors are logged, never returned.
    pub async fn stop(&self) {
        info!("Stopping messaging");

        if let Some(supervisor) = self.supervisor.lock().await.take() {
            let _ = supervisor.stop.send(true);
            if let Err(e) = supervisor.task.await {
                warn!(error = %e, "Reconnect supervisor ended abnormally");
            }
        }

        for subscription in self.shared.subscriptions.lock().await.iter_mut() {
            subscription.handle.cancel().await;
        }

        for publisher in self.shared.publishers.lock().await.iter() {
            publisher.close().await;
        }

        if let Err(e) = self.shared.context.close().await {
            warn!(error = %e, "Error closing messaging context");
        }

        info!("Messaging stopped");
    }
}

async fn supervise_connection(
    shared: Arc<Shared>,
    broker: Arc<dyn Broker>,
    reconnect: ReconnectConfig,
    mut stop: watch::Receiver<bool>,
) {
    let backoff_builder = ExponentialBuilder::default()
        .with_min_delay(reconnect.min_delay())
        .with_max_delay(reconnect.max_delay())
        .with_jitter();

    let mut state = broker.subscribe_state();

    loop {
        // Wait for the connection to drop.
        loop {
            let current = *state.borrow_and_update();
            if current == ConnectionState::Disconnected {
                break;
            }
            tokio::select! {
                _ = stop.changed() => return,
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        warn!("Broker connection lost, reconnecting");
        let mut backoff = backoff_builder.build();

        loop {
            let delay = backoff.next().unwrap_or(reconnect.max_delay());
            tokio::select! {
                _ = stop.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match shared.restore(broker.as_ref()).await {
                Ok(()) => {
                    info!("Messaging restored after reconnect");
                    break;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Reconnect attempt failed, retrying after backoff"
                    );
                }
            }
        }
    }
}
