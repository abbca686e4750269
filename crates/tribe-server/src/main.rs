//! # Tribecast Server
//!
//! Streams tribe notifications from Redis to browsers over server-sent events.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! tribecast
//!
//! # Run with environment variables
//! TRIBECAST_PORT=8080 ATLAS_REDIS_ADDRESS=redis:6379 tribecast
//! ```
//!
//! A `tribecast.toml` in the working directory, `/etc/tribecast/` or
//! `~/.config/tribecast/` is picked up automatically.

mod config;
mod handlers;
mod metrics;
mod redis;
mod resp;

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tribecast_core::Broker;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tribecast=debug,tribecast_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Tribecast server on {}:{}", config.host, config.port);
    tracing::info!(upstream = ?config.upstream, broker = ?config.broker, "Configuration loaded");

    // Initialize metrics
    metrics::init_metrics();

    let upstream = Arc::new(redis::RedisUpstream::new(&config.upstream));
    let broker = Broker::with_config(upstream, config.broker_config());

    // Start the server
    handlers::run_server(config, broker).await?;

    Ok(())
}
