//! courier-relay: directory-side identity relay
//!
//! Consumes `identity.registered` from the identity exchange, materializes
//! each identity into the directory store and announces the stored record as
//! `identity.materialized` on the directory exchange.
//!
//! ## Architecture
//! ```text
//! [identity.events] -> [courier-relay] -> [directory.events]
//!                            |
//!                            v
//!                     [directory store]
//! ```
//!
//! ## Configuration
//! - COURIER_CONFIG or first argument: YAML configuration file
//! - COURIER__MESSAGING__URL (or RABBITMQ_URL): broker URL; unset disables messaging
//! - COURIER__STORAGE__TYPE / COURIER__STORAGE__PATH: identity store backend

use std::sync::Arc;

use tracing::{error, info};

use courier::bus::topology::{DIRECTORY_EVENTS_EXCHANGE, IDENTITY_MATERIALIZED, IDENTITY_REGISTERED};
use courier::bus::ExchangeBinding;
use courier::config::Config;
use courier::handlers::MaterializeHandler;
use courier::lifecycle::Lifecycle;
use courier::materializer::IdentityMaterializer;
use courier::storage::init_storage;
use courier::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(service = %config.service.name, "Starting courier-relay");

    let store = init_storage(&config.storage).await?;
    let materializer = IdentityMaterializer::new(store);

    let lifecycle = Lifecycle::connect(&config).await.map_err(|e| {
        error!("Failed to connect messaging: {}", e);
        e
    })?;

    let publisher = lifecycle.publisher(&[DIRECTORY_EVENTS_EXCHANGE]).await?;
    let handler = MaterializeHandler::new(IDENTITY_REGISTERED, materializer).with_onward(
        publisher,
        DIRECTORY_EVENTS_EXCHANGE,
        IDENTITY_MATERIALIZED,
    );
    lifecycle
        .subscribe(ExchangeBinding::directory(), Arc::new(handler))
        .await?;
    lifecycle.supervise().await;

    info!("courier-relay running, press Ctrl+C to exit");
    shutdown_signal().await;

    lifecycle.stop().await;
    Ok(())
}
