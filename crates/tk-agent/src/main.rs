//! tunnelkeeper daemon
//!
//! Keeps a set of SSH port forwards open, reconnecting whenever the session
//! to the remote server is lost.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tk_agent::ssh::{SshSettings, SshTransport};
use tk_agent::{LocalNetwork, Orchestrator};
use tk_core::config::{self, ForwarderConfig};
use tk_core::TunnelSpec;

#[derive(Parser)]
#[command(name = "tunnelkeeper")]
#[command(about = "Keeps SSH port forwards alive across reconnects")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SSH server to connect to (host or host:port)
    #[arg(short, long, env = "TUNNELKEEPER_SERVER")]
    remote_server: Option<String>,

    /// User to authenticate as
    #[arg(short, long)]
    user: Option<String>,

    /// Private key file (relative names are looked up in ~/.ssh)
    #[arg(short, long)]
    keyfile: Option<PathBuf>,

    /// known_hosts file used to verify the server
    #[arg(long)]
    known_hosts: Option<PathBuf>,

    /// Tunnel to keep open, e.g. "L 8080:127.0.0.1:80" (repeatable; replaces
    /// the tunnels from the config file)
    #[arg(short, long = "tunnel")]
    tunnels: Vec<TunnelSpec>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("tunnelkeeper starting...");

    let config = load_config(&args)?;
    config.validate().context("Invalid configuration")?;

    for spec in config.registry().iter() {
        tracing::info!("Tunnel: {}", spec);
    }

    let settings = SshSettings::from_config(&config);
    tracing::info!(
        "Forwarding over {} as '{}'",
        settings.address(),
        settings.user
    );
    let transport = SshTransport::new(settings).context("Failed to prepare SSH transport")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let orchestrator = Orchestrator::from_config(transport, Arc::new(LocalNetwork::new()), &config);
    orchestrator.run(shutdown).await;

    tracing::info!("tunnelkeeper stopped");
    Ok(())
}

/// Load the config file and apply command-line overrides
fn load_config(args: &Args) -> Result<ForwarderConfig> {
    let mut config = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => {
            let path = config::default_config_path();
            if path.exists() {
                config::load_config(&path)
                    .with_context(|| format!("Failed to load config from {:?}", path))?
            } else {
                tracing::debug!("No config file at {:?}, using defaults", path);
                ForwarderConfig::default()
            }
        }
    };

    if let Some(server) = &args.remote_server {
        config.remote_server = server.clone();
    }
    if let Some(user) = &args.user {
        config.user = user.clone();
    }
    if let Some(keyfile) = &args.keyfile {
        config.keyfile = keyfile.clone();
    }
    if let Some(known_hosts) = &args.known_hosts {
        config.known_hosts = Some(known_hosts.clone());
    }
    if !args.tunnels.is_empty() {
        config.tunnels = args.tunnels.clone();
    }

    Ok(config)
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        shutdown.cancel();
    });
}
