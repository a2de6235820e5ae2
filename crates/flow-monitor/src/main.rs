//! Flow Monitor CLI

use clap::Parser;
use event_bus_core::GatewayConfig;
use event_gateway::NatsTransport;
use flow_monitor::FlowMonitor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "flow-monitor")]
#[command(about = "End-to-end flow tracing and latency alerts for event bus topics")]
#[command(version)]
struct Args {
    /// Configuration file (toml, yaml or json)
    #[arg(short, long, env = "EVENT_BUS_CONFIG")]
    config: Option<String>,

    /// Transport URL, overrides the configuration file
    #[arg(long, env = "TRANSPORT_URL")]
    transport_url: Option<String>,

    /// Topic to publish alerts to
    #[arg(long, env = "FLOW_MONITOR_ALERTS_TOPIC")]
    alerts_topic: Option<String>,

    /// Seconds between analysis runs
    #[arg(long)]
    analysis_interval: Option<u64>,

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
    if let Some(topic) = args.alerts_topic {
        config.monitor.alerts_topic = Some(topic);
    }
    if let Some(secs) = args.analysis_interval {
        config.monitor.analysis_interval = Duration::from_secs(secs);
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
        flows = config.monitor.flows.len(),
        "Starting flow-monitor"
    );

    let mut transport_config = config.transport.clone();
    transport_config.connection_name = format!("{}-monitor", transport_config.connection_name);
    let transport = Arc::new(NatsTransport::connect(&transport_config).await?);
    let monitor = FlowMonitor::new(config.monitor, transport)?;

    if let Err(e) = monitor.start().await {
        error!(error = %e, "Failed to start flow monitor");
        monitor.shutdown().await;
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    monitor.shutdown().await;
    info!("flow-monitor stopped");
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
