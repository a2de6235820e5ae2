//! Event Gateway CLI

use clap::Parser;
use event_bus_core::GatewayConfig;
use event_gateway::{Gateway, NatsTransport};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "event-gateway")]
#[command(about = "Filtering, routing and dead-lettering gateway for event bus topics")]
#[command(version)]
struct Args {
    /// Configuration file (toml, yaml or json)
    #[arg(short, long, env = "EVENT_BUS_CONFIG")]
    config: Option<String>,

    /// Transport URL, overrides the configuration file
    #[arg(long, env = "TRANSPORT_URL")]
    transport_url: Option<String>,

    /// Pooled transport connections, overrides the configuration file
    #[arg(long, env = "TRANSPORT_POOL_SIZE")]
    pool_size: Option<usize>,

    /// Log level, overrides the configuration file
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: json or pretty
    #[arg(long, env = "LOG_FORMAT")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(url) = args.transport_url {
        config.transport.url = url;
    }
    if let Some(pool_size) = args.pool_size {
        config.transport.pool_size = pool_size;
    }
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }
    if let Some(format) = args.log_format {
        config.observability.log_format = format;
    }

    init_tracing(&config.observability.log_level, &config.observability.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        url = %config.transport.url,
        topics = config.topics.len(),
        "Starting event-gateway"
    );

    let transport = Arc::new(NatsTransport::connect(&config.transport).await?);
    let gateway = Gateway::new(config, transport)?;

    if let Err(e) = gateway.start().await {
        error!(error = %e, "Failed to start gateway");
        gateway.shutdown().await;
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    gateway.shutdown().await;
    info!("event-gateway stopped");
    Ok(())
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}
