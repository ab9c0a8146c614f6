use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gtunnel::config::{public_url, DEFAULT_SERVER_URL};
use gtunnel::{connect, status, AgentConfig, ClientConfig, LocalService};

#[derive(Parser)]
#[command(name = "gtunnel")]
#[command(author = "gTunnel Team")]
#[command(version)]
#[command(about = "Expose a local HTTP service through a gTunnel relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to client.yaml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose a local HTTP service
    Connect {
        /// Local port to expose
        port: u16,

        /// Local host to forward to
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Relay URL
        #[arg(short, long)]
        server: Option<String>,

        /// Access token
        #[arg(short, long)]
        token: Option<String>,

        /// Requested base URL (routing prefix); the relay picks one if omitted
        #[arg(short, long = "base-url")]
        base_url: Option<String>,
    },
    /// Check whether the relay is up
    Status {
        /// Relay URL
        #[arg(short, long)]
        server: Option<String>,
    },
    /// Show or change saved settings
    Config {
        /// Save the relay URL
        #[arg(long)]
        set_url: Option<String>,

        /// Save the access token
        #[arg(long)]
        set_token: Option<String>,

        /// Print the current settings
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "gtunnel=debug" } else { "gtunnel=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => ClientConfig::default_path().context("Could not determine the config directory")?,
    };
    let saved = ClientConfig::load(&config_path)?;

    match cli.command {
        Commands::Connect {
            port,
            host,
            server,
            token,
            base_url,
        } => {
            let server_url = server
                .or(saved.server_url)
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
            let access_token = token
                .or_else(|| std::env::var("GTUNNEL_ACCESS_TOKEN").ok())
                .or(saved.access_token)
                .unwrap_or_default();

            let mut agent = AgentConfig::new(server_url, access_token, port);
            agent.local_host = host;
            agent.requested_prefix = base_url.unwrap_or_default().trim_matches('/').to_string();
            run_tunnel(agent).await?;
        }
        Commands::Status { server } => {
            let server_url = server
                .or(saved.server_url)
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
            let report = status::check_health(&server_url, Duration::from_secs(5))
                .await
                .with_context(|| format!("Relay at {} is unreachable", server_url))?;

            println!("Relay:   {}", report.url);
            println!("Status:  {}", report.status);
            println!("Latency: {} ms", report.latency.as_millis());
            if !report.is_healthy() {
                bail!("Relay reported status {}", report.status);
            }
        }
        Commands::Config {
            set_url,
            set_token,
            show,
        } => {
            let mut updated = saved.clone();
            if let Some(url) = set_url {
                updated.server_url = Some(url);
            }
            if let Some(token) = set_token {
                updated.access_token = Some(token);
            }
            if updated != saved {
                updated.save(&config_path)?;
                println!("Saved {}", config_path.display());
            }
            if show || updated == saved {
                println!("Config file:  {}", config_path.display());
                println!("Server URL:   {}", updated.server_url.as_deref().unwrap_or("(not set)"));
                println!(
                    "Access token: {}",
                    if updated.access_token.as_deref().unwrap_or("").is_empty() { "(not set)" } else { "(set)" }
                );
            }
        }
    }

    Ok(())
}

async fn run_tunnel(config: AgentConfig) -> Result<()> {
    let service = LocalService::new(config.local_base_url(), config.request_timeout)
        .context("Failed to build HTTP client")?;
    let session = connect(&config).await?;

    let prefix = session
        .prefix
        .clone()
        .unwrap_or_else(|| config.requested_prefix.clone());
    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  gTunnel Active                                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Public URL: {:<47} ║", public_url(&config.server_url, &prefix));
    println!("║  Local:      {:<47} ║", service.base_url());
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Press Ctrl+C to stop the tunnel\n");

    tokio::select! {
        result = session.run(service, config.keepalive_interval) => {
            result.context("Tunnel connection lost")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
