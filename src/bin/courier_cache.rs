//! courier-cache: cache-side identity materializer
//!
//! Consumes `identity.materialized` from the directory exchange and keeps a
//! local copy of every identity. This is the end of the chain; nothing is
//! republished.
//!
//! ## Configuration
//! - COURIER_CONFIG or first argument: YAML configuration file
//! - COURIER__MESSAGING__URL (or RABBITMQ_URL): broker URL; unset disables messaging
//! - COURIER__STORAGE__TYPE / COURIER__STORAGE__PATH: identity store backend

use std::sync::Arc;

use tracing::{error, info};

use courier::bus::topology::IDENTITY_MATERIALIZED;
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

    info!(service = %config.service.name, "Starting courier-cache");

    let store = init_storage(&config.storage).await?;
    let handler = MaterializeHandler::new(IDENTITY_MATERIALIZED, IdentityMaterializer::new(store));

    let lifecycle = Lifecycle::connect(&config).await.map_err(|e| {
        error!("Failed to connect messaging: {}", e);
        e
    })?;
    lifecycle
        .subscribe(ExchangeBinding::cache(), Arc::new(handler))
        .await?;
    lifecycle.supervise().await;

    info!("courier-cache running, press Ctrl+C to exit");
    shutdown_signal().await;

    lifecycle.stop().await;
    Ok(())
}
