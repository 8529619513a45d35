//! IPC server implementation
//!
//! Listens on localhost TCP for requests from the CLI. Only loopback
//! peers are served.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use sk_core::ipc::{IpcRequest, IpcResponse, NodeEvent};
use sk_core::types::MachineId;

use crate::coordinator::DiscoveryCoordinator;

/// IPC server for CLI communication
pub struct IpcServer {
    listener: TcpListener,
    coordinator: Arc<DiscoveryCoordinator>,
    /// Cancelled by a `shutdown` request, and by the owner to stop serving
    shutdown: CancellationToken,
}

impl IpcServer {
    /// Bind the IPC address. The port may be 0 in tests.
    pub async fn bind(
        address: &str,
        coordinator: Arc<DiscoveryCoordinator>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind IPC server to {}", address))?;
        Ok(Self {
            listener,
            coordinator,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve clients until the shutdown token fires
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("IPC server listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("IPC server shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            // Only accept connections from localhost
                            if !peer_addr.ip().is_loopback() {
                                tracing::warn!("Rejected non-localhost connection from {}", peer_addr);
                                continue;
                            }

                            let coordinator = Arc::clone(&self.coordinator);
                            let shutdown = self.shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, coordinator, shutdown).await {
                                    tracing::warn!("IPC client error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept IPC connection: {}", e);
                        }
                    }
                }
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    coordinator: Arc<DiscoveryCoordinator>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    // Set once the client subscribes
    let mut events: Option<broadcast::Receiver<NodeEvent>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => break, // EOF
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            line.clear();
                            continue;
                        }

                        let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                            Ok(IpcRequest::Subscribe) => {
                                events = Some(coordinator.state().subscribe());
                                tracing::debug!("IPC client subscribed to events");
                                IpcResponse::Ok
                            }
                            Ok(request) => handle_request(request, &coordinator, &shutdown).await,
                            Err(e) => IpcResponse::Error {
                                message: format!("Invalid request: {}", e),
                            },
                        };

                        write_line(&mut writer, &response).await?;
                        line.clear();
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            result = next_event(&mut events) => {
                match result {
                    Ok(event) => write_line(&mut writer, &event).await?,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("IPC client lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}

/// Next event for a subscribed client; never resolves otherwise
async fn next_event(
    events: &mut Option<broadcast::Receiver<NodeEvent>>,
) -> Result<NodeEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_line<T: serde::Serialize>(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    value: &T,
) -> Result<()> {
    let mut json = serde_json::to_string(value)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}

async fn handle_request(
    request: IpcRequest,
    coordinator: &DiscoveryCoordinator,
    shutdown: &CancellationToken,
) -> IpcResponse {
    let state = coordinator.state();

    match request {
        IpcRequest::Ping => IpcResponse::Pong,

        IpcRequest::GetStatus => IpcResponse::Status(coordinator.status()),

        IpcRequest::ListPeers => IpcResponse::Peers {
            peers: coordinator.list_peers(),
        },

        IpcRequest::GetPeer { machine_id } => match state.get_peer(&MachineId::new(&machine_id)) {
            Some(peer) => IpcResponse::Peer(peer),
            None => IpcResponse::Error {
                message: format!("Machine not found: {}", machine_id),
            },
        },

        IpcRequest::DiscoverNow => match coordinator.discover_now().await {
            Ok(peers) => IpcResponse::Discovered { peers },
            Err(e) => IpcResponse::Error {
                message: e.to_string(),
            },
        },

        IpcRequest::ListLinks => IpcResponse::Links {
            links: coordinator.links(),
        },

        IpcRequest::CheckPort { port } => IpcResponse::PortAvailability {
            port,
            available: state.ports.check(port),
        },

        IpcRequest::ClaimPort { port, service, pid } => {
            IpcResponse::PortOutcome(state.claim_port(port, &service, pid))
        }

        IpcRequest::ReleasePort { port } => IpcResponse::PortOutcome(state.release_port(port)),

        IpcRequest::ValidateService { service, port } => {
            IpcResponse::Validation(state.ports.validate_service(&service, port))
        }

        IpcRequest::GetPortStatus => IpcResponse::PortStatus(state.ports.status()),

        // Handled per connection before dispatch
        IpcRequest::Subscribe => IpcResponse::Ok,

        IpcRequest::Shutdown => {
            tracing::info!("Shutdown requested via IPC");
            shutdown.cancel();
            IpcResponse::Ok
        }
    }
}
