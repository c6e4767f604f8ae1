mod config;
mod consumer_pool;
mod handlers;
mod lifecycle;
mod models;
mod producer_pool;
mod registry;
mod routes;
mod server;

use anyhow::{Context, Result};
use shared::observability::{init_logging, LogConfig, MetricsCollector};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::lifecycle::{build_broker, shutdown_signal, Coordinator};
use crate::producer_pool::ProducerPool;
use crate::registry::TopicRegistry;

/// Shared by every request handler
pub struct AppState {
    pub config: Config,
    pub registry: Arc<TopicRegistry>,
    pub producers: Arc<ProducerPool>,
    pub metrics: Arc<MetricsCollector>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::load().context("Failed to load configuration")?;

    init_logging(LogConfig {
        level: config.logging.level,
        format: config.logging.format,
        ..Default::default()
    })
    .context("Failed to initialize logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        brokers = %config.kafka.brokers.join(","),
        backend = ?config.kafka.backend,
        "Starting events service"
    );

    let metrics = Arc::new(MetricsCollector::new());
    let broker = build_broker(&config);
    let address = config.server_address();
    let coordinator = Coordinator::new(config, broker, metrics);

    let components = coordinator
        .start()
        .await
        .context("Failed to initialize broker clients")?;

    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            coordinator.abandon(components).await;
            return Err(e).with_context(|| format!("Failed to bind {}", address));
        }
    };
    info!("Events service listening on {}", address);

    coordinator
        .serve(components, listener, shutdown_signal())
        .await
        .context("Events service stopped abnormally")?;

    info!(state = ?coordinator.state(), "Events service stopped");
    Ok(())
}
