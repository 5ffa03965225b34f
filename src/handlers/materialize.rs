//! Consumer handler that materializes identities and continues the chain.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::bus::{EventEnvelope, EventHandler, HandlerError, Publisher};
use crate::materializer::IdentityMaterializer;

/// Where a materialized record is announced next.
#[derive(Clone)]
struct Onward {
    publisher: Arc<Publisher>,
    exchange: String,
    event_type: String,
}

/// Materializes envelopes of one event type into the local store.
///
/// With an onward target configured, every successful upsert is followed by a
/// publication of the stored record on a detached task. The handler returns,
/// and the source message is acked, without waiting for the broker to confirm
/// it. A failed onward publish is logged by the publisher and never fails the
/// handler.
pub struct MaterializeHandler {
    event_type: String,
    materializer: IdentityMaterializer,
    onward: Option<Onward>,
}

impl MaterializeHandler {
    pub fn new(event_type: impl Into<String>, materializer: IdentityMaterializer) -> Self {
        Self {
            event_type: event_type.into(),
            materializer,
            onward: None,
        }
    }

    /// Republish each materialized record as `event_type` on `exchange`.
    pub fn with_onward(
        mut self,
        publisher: Arc<Publisher>,
        exchange: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        self.onward = Some(Onward {
            publisher,
            exchange: exchange.into(),
            event_type: event_type.into(),
        });
        self
    }
}

impl EventHandler for MaterializeHandler {
    fn handle(&self, envelope: Arc<EventEnvelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let expected = self.event_type.clone();
        let materializer = self.materializer.clone();
        let onward = self.onward.clone();

        Box::pin(async move {
            if envelope.event_type != expected {
                debug!(
                    event_type = %envelope.event_type,
                    expected = %expected,
                    "Ignoring unexpected event type"
                );
                return Ok(());
            }

            let record = materializer.materialize(&envelope.payload).await?;
            info!(id = %record.id, event_type = %envelope.event_type, "Identity materialized");

            if let Some(onward) = onward {
                let next = EventEnvelope::new(onward.event_type, record.to_payload())
                    .with_correlation_id(envelope.metadata.correlation_id.clone())
                    .with_causation_id(Some(format!("{}:{}", envelope.event_type, record.id)));
                tokio::spawn(async move {
                    onward.publisher.publish_event(&onward.exchange, &next).await;
                });
            }

            Ok(())
        })
    }
}
