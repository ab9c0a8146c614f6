use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gtunnel_relay::{serve, AppState, RelayConfig};

#[derive(Parser)]
#[command(name = "gtunnel-relay")]
#[command(author = "gTunnel Team")]
#[command(version)]
#[command(about = "Public endpoint that forwards HTTP traffic to gTunnel agents", long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    host: Option<IpAddr>,

    /// Path to server.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Access token agents must present
    #[arg(long)]
    access_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gtunnel_relay=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = RelayConfig::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.bind.set_ip(host);
    }
    if let Some(port) = cli.port {
        config.bind.set_port(port);
    }
    if let Some(token) = cli.access_token {
        config.access_token = token;
    }

    if config.access_token.is_empty() {
        warn!("Access token is not set; any agent sending an empty token will be accepted");
    }

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!("gTunnel Relay on {}", config.bind);

    serve(listener, AppState::new(config)).await?;
    Ok(())
}
