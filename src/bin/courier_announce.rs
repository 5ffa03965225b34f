//! courier-announce: publish one `identity.registered` event
//!
//! Usage: `courier-announce <id> <email> <display-name>`
//!
//! Messaging is required here; without a broker URL the command fails
//! instead of silently dropping the event.

use serde::Serialize;
use tracing::{error, info};

use courier::bus::topology::{IDENTITY_EVENTS_EXCHANGE, IDENTITY_REGISTERED};
use courier::bus::EventEnvelope;
use courier::config::Config;
use courier::lifecycle::Lifecycle;
use courier::utils::bootstrap::init_tracing;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Registered<'a> {
    id: &'a str,
    email: &'a str,
    display_name: &'a str,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [id, email, display_name] = args.as_slice() else {
        return Err("usage: courier-announce <id> <email> <display-name>".into());
    };

    let mut config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    config.messaging.required = true;

    let lifecycle = Lifecycle::connect(&config).await?;
    let publisher = lifecycle.publisher(&[IDENTITY_EVENTS_EXCHANGE]).await?;

    let payload = Registered {
        id,
        email,
        display_name,
        created_at: chrono::Utc::now(),
    };
    let envelope = EventEnvelope::new(IDENTITY_REGISTERED, payload)
        .with_correlation_id(Some(uuid::Uuid::new_v4().to_string()));

    let result = publisher
        .try_publish(IDENTITY_EVENTS_EXCHANGE, IDENTITY_REGISTERED, &envelope)
        .await;
    lifecycle.stop().await;

    result.map_err(|e| {
        error!(error = %e, "Identity not announced");
        e
    })?;
    info!(id = %id, "Identity announced");
    Ok(())
}
