//! Fleet daemon - connector and processor reconciliation service
//!
//! The daemon runs the reconcile workers that:
//! - Keep the connector and processor type catalogs in storage
//! - Place connectors onto clusters and processors into namespaces
//! - Propagate workload edits to their deployments
//! - Tear down deleted workloads, expired namespaces and deleting clusters

use anyhow::Context;
use clap::Parser;
use fleet_daemon::{DaemonConfig, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Fleet daemon CLI
#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "Fleet daemon - connector and processor reconciliation", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: Option<String>,

    /// PostgreSQL connection URL; in-memory storage is used when unset
    #[arg(long, env = "FLEET_STORAGE_URL")]
    storage_url: Option<String>,

    /// Log level, overriding the configured one
    #[arg(long, env = "FLEET_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "FLEET_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.config.as_deref())
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

    if let Some(url) = cli.storage_url {
        config.storage = config.storage.with_postgres_url(url);
    }

    // Initialize tracing
    let level = cli.log_level.unwrap_or_else(|| config.logging.level.clone());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        storage = config.storage.kind(),
        "Starting fleet daemon"
    );

    Server::new(config).run().await.context("Fleet daemon failed")
}
