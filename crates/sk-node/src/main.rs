//! skein node daemon
//!
//! Announces this machine on the LAN, tracks every other node, keeps
//! cluster links to them and serves the local CLI over IPC.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sk_core::config::NodeConfig;
use sk_node::ipc::IpcServer;
use sk_node::DiscoveryCoordinator;

#[derive(Parser)]
#[command(name = "skein-node")]
#[command(about = "skein LAN discovery and cluster node")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Beacon port (overrides config)
    #[arg(long)]
    beacon_port: Option<u16>,

    /// IPC port (overrides config)
    #[arg(long)]
    ipc_port: Option<u16>,

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
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("skein node starting...");

    let mut config = NodeConfig::load(args.config.as_deref())
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(port) = args.beacon_port {
        config.discovery.beacon_port = port;
    }
    if let Some(port) = args.ipc_port {
        config.node.ipc_port = port;
    }
    let ipc_address = config.ipc_address();

    let coordinator = DiscoveryCoordinator::new(config).context("Invalid configuration")?;
    coordinator
        .start()
        .await
        .context("Failed to start discovery")?;

    let shutdown = CancellationToken::new();

    let ipc = IpcServer::bind(&ipc_address, Arc::clone(&coordinator), shutdown.clone())
        .await?;
    let ipc_task = tokio::spawn(ipc.run());

    // Setup signal handlers
    let signal_token = shutdown.clone();
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
            _ = signal_token.cancelled() => return,
        }

        signal_token.cancel();
    });

    shutdown.cancelled().await;
    coordinator.stop().await;
    let _ = ipc_task.await;

    tracing::info!("skein node shutdown complete");
    Ok(())
}
