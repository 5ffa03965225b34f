//! AMQP (RabbitMQ) broker implementation.
//!
//! One lapin `Connection` per process. Publish channels run in confirm mode so
//! a broker-side refusal surfaces as `Ok(false)`; consume channels apply
//! `basic.qos` before consuming with manual acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use super::{
    redact_url, Acknowledger, Broker, BrokerChannel, BusError, ChannelRole, ConnectionState,
    Delivery, DeliveryStream, Result,
};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

/// RabbitMQ-backed broker.
pub struct AmqpBroker {
    url: String,
    connect_timeout: Duration,
    connection: RwLock<Option<Arc<Connection>>>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl AmqpBroker {
    /// Connect to the broker at `url`.
    pub async fn connect(url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let url = url.into();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let broker = Self {
            url,
            connect_timeout,
            connection: RwLock::new(None),
            state: Arc::new(state),
        };

        broker.establish().await?;
        Ok(broker)
    }

    async fn establish(&self) -> Result<()> {
        self.state.send_replace(ConnectionState::Connecting);

        let attempt = Connection::connect(&self.url, ConnectionProperties::default());
        let connection = match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(BusError::Connection(format!(
                    "Failed to connect to {}: {}",
                    redact_url(&self.url),
                    e
                )));
            }
            Err(_) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(BusError::Connection(format!(
                    "Timed out connecting to {} after {:?}",
                    redact_url(&self.url),
                    self.connect_timeout
                )));
            }
        };

        let state = Arc::clone(&self.state);
        connection.on_error(move |e| {
            warn!(error = %e, "AMQP connection lost");
            state.send_replace(ConnectionState::Disconnected);
        });

        *self.connection.write().await = Some(Arc::new(connection));
        self.state.send_replace(ConnectionState::Connected);

        info!(url = %redact_url(&self.url), "Connected to AMQP");
        Ok(())
    }

    async fn current(&self) -> Result<Arc<Connection>> {
        let guard = self.connection.read().await;
        match guard.as_ref() {
            Some(connection) if connection.status().connected() => Ok(Arc::clone(connection)),
            _ => Err(BusError::Connection("AMQP connection is not open".to_string())),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_channel(&self, role: ChannelRole) -> Result<Arc<dyn BrokerChannel>> {
        let connection = self.current().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        if role == ChannelRole::Publish {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| BusError::Channel(format!("Failed to enable confirms: {}", e)))?;
        }

        debug!(channel = channel.id(), role = ?role, "Opened AMQP channel");
        Ok(Arc::new(AmqpChannel { channel, role }))
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn close(&self) -> Result<()> {
        let connection = self.connection.write().await.take();
        self.state.send_replace(ConnectionState::Disconnected);

        if let Some(connection) = connection {
            if connection.status().connected() {
                connection
                    .close(REPLY_SUCCESS, "shutdown")
                    .await
                    .map_err(|e| BusError::Connection(format!("Failed to close: {}", e)))?;
            }
            info!("AMQP connection closed");
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        if self.current().await.is_ok() {
            return Ok(());
        }
        self.establish().await
    }
}

struct AmqpChannel {
    channel: Channel,
    role: ChannelRole,
}

impl AmqpChannel {
    fn ensure_role(&self, role: ChannelRole) -> Result<()> {
        if self.role != role {
            return Err(BusError::Channel(format!(
                "Channel {} is a {:?} channel, cannot be used for {:?}",
                self.channel.id(),
                self.role,
                role
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn role(&self) -> ChannelRole {
        self.role
    }

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Channel(format!("Failed to declare exchange {}: {}", name, e)))
    }

    async fn declare_queue(&self, name: &str, dead_letter_exchange: Option<&str>) -> Result<()> {
        let mut arguments = FieldTable::default();
        if let Some(dlx) = dead_letter_exchange {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dlx.into()),
            );
        }

        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(|e| BusError::Channel(format!("Failed to declare queue {}: {}", name, e)))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Channel(format!("Failed to bind queue {}: {}", queue, e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<bool> {
        self.ensure_role(ChannelRole::Publish)?;

        let properties = BasicProperties::default()
            .with_content_type(content_type.into())
            .with_delivery_mode(PERSISTENT);

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| BusError::Channel(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| BusError::Channel(format!("Failed to confirm publish: {}", e)))?;

        Ok(!matches!(confirm, Confirmation::Nack(_)))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.ensure_role(ChannelRole::Consume)?;

        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Channel(format!("Failed to set prefetch: {}", e)))?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Channel(format!("Failed to start consumer: {}", e)))?;

        let stream = consumer.map(|result| {
            let delivery =
                result.map_err(|e| BusError::Channel(format!("Delivery failed: {}", e)))?;
            let routing_key = delivery.routing_key.as_str().to_string();
            Ok(Delivery::new(
                routing_key,
                delivery.data,
                delivery.redelivered,
                Box::new(AmqpAcker(delivery.acker)),
            ))
        });

        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BusError::Channel(format!("Failed to cancel consumer: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "closed")
            .await
            .map_err(|e| BusError::Channel(format!("Failed to close channel: {}", e)))
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Channel(format!("Failed to ack: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BusError::Channel(format!("Failed to nack: {}", e)))
    }
}
