//! skein CLI
//!
//! Single binary for every skein operation:
//! - Node (announces this machine, tracks peers, arbitrates ports)
//! - Management commands (status, peers, ports, watch, etc.)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sk_core::config::{self, NodeConfig};
use skein::commands;
use skein::ipc::{resolve_ipc_address, NodeClient};
use skein::output::{print_error, print_info, print_success, print_warning};

#[derive(Parser)]
#[command(name = "skein")]
#[command(author, version, about = "LAN machine discovery and port arbitration")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node daemon on this machine
    /// Alias: start
    #[command(alias = "start")]
    Serve {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
        /// Beacon port (overrides config)
        #[arg(long)]
        beacon_port: Option<u16>,
    },

    /// Stop the running node
    Stop,

    /// Show node and cluster status
    Status {
        /// Show ports, capacity and pending links
        #[arg(short, long)]
        detailed: bool,
    },

    /// List discovered machines
    Peers {
        /// Only machines whose id, hostname or address contains this
        filter: Option<String>,
        /// Show detailed information
        #[arg(short, long)]
        long: bool,
    },

    /// Show one machine
    Peer {
        /// Machine id
        machine_id: String,
    },

    /// Announce now and list machines that answer
    Discover,

    /// List cluster links
    Links,

    /// Stream node events
    Watch,

    /// Port arbitration
    Ports {
        #[command(subcommand)]
        action: PortsAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum PortsAction {
    /// Show reserved and claimed ports
    Status,
    /// Check whether a port is free right now
    Check { port: u16 },
    /// Claim a port for a service
    Claim {
        port: u16,
        service: String,
        /// Owning process id
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Release a claimed port
    Release { port: u16 },
    /// Check a service/port pair, or get a port suggestion
    Validate {
        service: String,
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show effective configuration
    Show,
    /// Get specific config value
    Get { key: String },
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let command = match cli.command {
        Some(cmd) => cmd,
        None => {
            show_quick_status(cli.config.as_ref()).await;
            return Ok(());
        }
    };

    let mut client = NodeClient::new(ipc_address(cli.config.as_ref()));

    let granted = match command {
        Commands::Serve {
            foreground,
            beacon_port,
        } => {
            run_node(foreground, beacon_port, cli.config.as_ref()).await?;
            true
        }

        Commands::Stop => {
            print_info("Stopping node...");
            match client.shutdown().await {
                Ok(()) => print_success("Node stopped"),
                Err(e) if e.to_string().contains("Is it running") => {
                    print_warning("Node is not running")
                }
                Err(e) => print_error(&format!("Failed to stop node: {}", e)),
            }
            true
        }

        Commands::Status { detailed } => {
            commands::status_command(&mut client, detailed).await?;
            true
        }

        Commands::Peers { filter, long } => {
            commands::peers_command(&mut client, filter.as_deref(), long).await?;
            true
        }

        Commands::Peer { machine_id } => {
            commands::peer_command(&mut client, &machine_id).await?;
            true
        }

        Commands::Discover => {
            commands::discover_command(&mut client).await?;
            true
        }

        Commands::Links => {
            commands::links_command(&mut client).await?;
            true
        }

        Commands::Watch => {
            commands::watch_command(&mut client).await?;
            true
        }

        Commands::Ports { action } => match action {
            PortsAction::Status => commands::ports_status(&mut client).await?,
            PortsAction::Check { port } => commands::ports_check(&mut client, port).await?,
            PortsAction::Claim { port, service, pid } => {
                commands::ports_claim(&mut client, port, &service, pid).await?
            }
            PortsAction::Release { port } => commands::ports_release(&mut client, port).await?,
            PortsAction::Validate { service, port } => {
                commands::ports_validate(&mut client, &service, port).await?
            }
        },

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                commands::config_show(cli.config.as_deref())?;
                true
            }
            ConfigAction::Get { key } => commands::config_get(cli.config.as_deref(), &key)?,
            ConfigAction::Init { force } => commands::config_init(cli.config.as_deref(), force)?,
            ConfigAction::Path => {
                let path = cli.config.unwrap_or_else(config::default_config_path);
                println!("{}", path.display());
                true
            }
        },
    };

    if !granted {
        std::process::exit(1);
    }
    Ok(())
}

/// IPC address from the environment or config. A broken config file is
/// not fatal for management commands.
fn ipc_address(config_path: Option<&PathBuf>) -> String {
    let config = NodeConfig::load(config_path.map(PathBuf::as_path)).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        NodeConfig::default()
    });
    resolve_ipc_address(&config)
}

// ============================================================================
// Node Implementation
// ============================================================================

async fn run_node(
    foreground: bool,
    beacon_port: Option<u16>,
    config_path: Option<&PathBuf>,
) -> Result<()> {
    use sk_node::ipc::IpcServer;
    use sk_node::DiscoveryCoordinator;

    if !foreground {
        // Daemonize by re-spawning ourselves
        let exe = std::env::current_exe()?;
        let mut cmd = std::process::Command::new(exe);
        cmd.arg("serve").arg("--foreground");
        if let Some(port) = beacon_port {
            cmd.arg("--beacon-port").arg(port.to_string());
        }
        if let Some(path) = config_path {
            cmd.arg("--config").arg(path);
        }

        let child = cmd
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;

        print_success(&format!("Node started (PID: {})", child.id()));
        return Ok(());
    }

    tracing::info!("skein node starting...");

    let mut config = NodeConfig::load(config_path.map(PathBuf::as_path))
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    if let Some(port) = beacon_port {
        config.discovery.beacon_port = port;
    }
    let ipc_address = resolve_ipc_address(&config);

    let coordinator = DiscoveryCoordinator::new(config).context("Invalid configuration")?;
    coordinator
        .start()
        .await
        .context("Failed to start discovery")?;

    let shutdown = CancellationToken::new();
    let ipc = IpcServer::bind(&ipc_address, Arc::clone(&coordinator), shutdown.clone()).await?;
    let ipc_task = tokio::spawn(ipc.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate() => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    coordinator.stop().await;
    let _ = ipc_task.await;

    tracing::info!("skein node stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

async fn show_quick_status(config_path: Option<&PathBuf>) {
    println!();
    println!("  \x1b[1;34mskein\x1b[0m - LAN machine discovery");
    println!();

    let mut client = NodeClient::new(ipc_address(config_path));

    if !client.ping().await {
        println!("  Node: \x1b[31m●\x1b[0m Not running ({})", client.address());
        println!("        Run: skein serve");
        println!();
        return;
    }

    match client.status().await {
        Ok(status) => {
            println!(
                "  Node: \x1b[32m●\x1b[0m {} ({})",
                status.machine_id, status.primary_ip
            );
            println!(
                "  Peers: {} online, links: {} established",
                status.peers_online, status.links.established
            );
        }
        Err(e) => println!("  Node: \x1b[33m●\x1b[0m {}", e),
    }
    println!();
}
