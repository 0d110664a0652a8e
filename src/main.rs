use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamgate::{config::Config, supervisor::Supervisor};

#[derive(Parser)]
#[command(name = "streamgate")]
#[command(version)]
#[command(about = "Multi-source streaming-link aggregation gateway")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "streamgate.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Worker count (overrides config and the sizing formula)
    #[arg(short, long, value_name = "N")]
    workers: Option<usize>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("streamgate={},tower_http=warn", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting streamgate v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(workers) = cli.workers {
        config.supervisor.workers = workers;
    }

    let enabled: Vec<&str> = config
        .providers
        .iter()
        .filter(|p| p.enabled)
        .map(|p| p.id.as_str())
        .collect();
    info!(providers = ?enabled, database = %config.database.url, "configuration ready");

    Supervisor::new(Arc::new(config)).run().await?;
    Ok(())
}
