//! # Relay Server
//!
//! Reliable-delivery realtime message relay.
//!
//! ## Usage
//!
//! ```bash
//! # Single process, in-process fan-out
//! relay
//!
//! # Multi-process: one hub, any number of workers on one database
//! RELAY_CLUSTER__ROLE=hub relay
//! RELAY_CLUSTER__ROLE=worker RELAY_PORT=5051 relay
//! RELAY_CLUSTER__ROLE=worker RELAY_PORT=5052 relay
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use crate::config::Role;
use relay_core::{BusHub, ClusterBus, FanoutBus, LocalBus, Relay, SqliteLog};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,relay_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let bus: Arc<dyn FanoutBus> = match config.cluster.role {
        Role::Hub => {
            let hub = BusHub::bind(config.cluster.hub_addr)
                .await
                .with_context(|| format!("Failed to bind hub on {}", config.cluster.hub_addr))?
                .with_queue(config.cluster.link_queue);
            hub.run().await?;
            return Ok(());
        }
        Role::Worker => Arc::new(ClusterBus::start(config.cluster_config())),
        Role::Standalone => Arc::new(LocalBus::new()),
    };

    let log = SqliteLog::open(config.log_config())
        .with_context(|| format!("Failed to open log at {}", config.storage.path.display()))?;

    info!(
        role = ?config.cluster.role,
        bus = bus.name(),
        "Starting Relay server on {}:{}",
        config.host,
        config.port
    );

    let relay = Relay::with_mailbox_capacity(Arc::new(log), bus, config.mailbox_capacity());
    handlers::run_server(relay, config).await?;

    Ok(())
}
