//! Link listener and dialer
//!
//! Accepts inbound cluster connections and opens outbound ones. Either
//! way the link runs in its own task, and when that task ends a
//! `LinkClosed` notice goes to whoever owns reconnection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use sk_core::error::LinkError;
use sk_core::types::{LinkDirection, LinkState, MachineId};

use super::connection::run_link;
use super::pool::{CloseReason, LinkCommand, LinkHandle};
use crate::state::NodeState;
use crate::tasks::TaskGroup;

/// Sent when a link task exits
#[derive(Clone)]
pub struct LinkClosed {
    pub handle: Arc<LinkHandle>,
    pub reason: CloseReason,
}

/// Starts link tasks and tracks them for shutdown
#[derive(Clone)]
pub struct LinkSpawner {
    state: Arc<NodeState>,
    closed: mpsc::UnboundedSender<LinkClosed>,
    tasks: TaskGroup,
    cancel: CancellationToken,
}

impl LinkSpawner {
    pub fn new(
        state: Arc<NodeState>,
        closed: mpsc::UnboundedSender<LinkClosed>,
        tasks: TaskGroup,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            closed,
            tasks,
            cancel,
        }
    }

    /// Run a link over an accepted connection
    pub fn accept(&self, stream: TcpStream, peer_addr: SocketAddr) -> Arc<LinkHandle> {
        let (handle, commands) = self.state.links.register(
            LinkDirection::Inbound,
            peer_addr.to_string(),
            None,
            &self.cancel,
        );
        self.run(Arc::clone(&handle), stream, commands);
        handle
    }

    /// Dial a peer. The handle exists (in `Connecting`) before this returns,
    /// so a second call for the same peer can see it.
    pub fn dial(&self, peer: MachineId, addr: String) -> Arc<LinkHandle> {
        let (handle, commands) = self.state.links.register(
            LinkDirection::Outbound,
            addr.clone(),
            Some(peer.clone()),
            &self.cancel,
        );

        let this = self.clone();
        let link = Arc::clone(&handle);
        let connect_timeout = self.state.config.cluster.connect_timeout;
        self.tasks.spawn(async move {
            tracing::debug!(link_id = link.id, machine_id = %peer, "Dialing {}", addr);

            let connected = tokio::select! {
                _ = link.cancel_token().cancelled() => Err(LinkError::Closed),
                result = timeout(connect_timeout, TcpStream::connect(&addr)) => match result {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(e)) => Err(LinkError::ConnectionRefused(format!("{}: {}", addr, e))),
                    Err(_) => Err(LinkError::ConnectTimeout(addr.clone())),
                },
            };

            match connected {
                Ok(stream) => {
                    let reason =
                        run_link(Arc::clone(&this.state), Arc::clone(&link), stream, commands)
                            .await;
                    this.finish(link, reason);
                }
                Err(e) => {
                    tracing::debug!(machine_id = %peer, "Failed to connect to {}: {}", addr, e);
                    link.set_state(LinkState::Closed);
                    let reason = link.close_reason().unwrap_or_else(|| e.into());
                    this.finish(link, reason);
                }
            }
        });

        handle
    }

    fn run(
        &self,
        handle: Arc<LinkHandle>,
        stream: TcpStream,
        commands: mpsc::Receiver<LinkCommand>,
    ) {
        let this = self.clone();
        self.tasks.spawn(async move {
            let reason =
                run_link(Arc::clone(&this.state), Arc::clone(&handle), stream, commands).await;
            this.finish(handle, reason);
        });
    }

    fn finish(&self, handle: Arc<LinkHandle>, reason: CloseReason) {
        self.state.links.remove(handle.id);
        if reason.is_intentional() {
            tracing::debug!(link_id = handle.id, "Link closed: {}", reason);
        } else {
            tracing::info!(
                link_id = handle.id,
                peer = ?handle.peer_id(),
                "Link closed: {}",
                reason
            );
        }
        // Receiver gone means we are shutting down
        let _ = self.closed.send(LinkClosed { handle, reason });
    }
}

/// Listener for inbound cluster links
pub struct LinkServer {
    listener: TcpListener,
}

impl LinkServer {
    /// Bind the cluster port
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until cancelled
    pub async fn run(self, spawner: LinkSpawner, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("Cluster link listener on {}", addr);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Cluster link listener shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            tracing::debug!("Inbound cluster connection from {}", peer_addr);
                            spawner.accept(stream, peer_addr);
                        }
                        Err(e) => {
                            tracing::warn!("Failed to accept cluster connection: {}", e);
                        }
                    }
                }
            }
        }
    }
}
