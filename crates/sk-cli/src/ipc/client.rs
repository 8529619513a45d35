//! IPC client for communicating with a running node
//!
//! One TCP connection per client, requests and responses as JSON lines.
//! After `subscribe` the node also pushes events on the same connection.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use sk_core::config::NodeConfig;
use sk_core::ipc::{
    IpcMessage, IpcRequest, IpcResponse, LinkInfo, NodeEvent, NodeStatus, PeerInfo,
};
use sk_core::ports::{PortOutcome, PortStatusReport, ServiceValidation};

/// Overrides the IPC address from the config
pub const IPC_ADDR_ENV: &str = "SKEIN_IPC_ADDR";

/// IPC address to use: `SKEIN_IPC_ADDR` if set, else the config's
pub fn resolve_ipc_address(config: &NodeConfig) -> String {
    match std::env::var(IPC_ADDR_ENV) {
        Ok(addr) if !addr.trim().is_empty() => addr.trim().to_string(),
        _ => config.ipc_address(),
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Client for communicating with the node daemon
pub struct NodeClient {
    address: String,
    conn: Option<Connection>,
}

impl NodeClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            conn: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect if not already connected
    pub async fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }

        tracing::debug!("Connecting to node at {}", self.address);

        let stream = TcpStream::connect(&self.address).await.with_context(|| {
            format!(
                "Failed to connect to node at {}. Is it running?",
                self.address
            )
        })?;
        let (reader, writer) = stream.into_split();
        self.conn = Some(Connection {
            reader: BufReader::new(reader),
            writer,
        });
        Ok(())
    }

    /// Whether a node answers on the address
    pub async fn ping(&mut self) -> bool {
        matches!(self.send_request(IpcRequest::Ping).await, Ok(IpcResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<NodeStatus> {
        match self.send_request(IpcRequest::GetStatus).await? {
            IpcResponse::Status(status) => Ok(status),
            other => unexpected(other),
        }
    }

    pub async fn list_peers(&mut self) -> Result<Vec<PeerInfo>> {
        match self.send_request(IpcRequest::ListPeers).await? {
            IpcResponse::Peers { peers } => Ok(peers),
            other => unexpected(other),
        }
    }

    pub async fn get_peer(&mut self, machine_id: &str) -> Result<PeerInfo> {
        let request = IpcRequest::GetPeer {
            machine_id: machine_id.to_string(),
        };
        match self.send_request(request).await? {
            IpcResponse::Peer(peer) => Ok(peer),
            other => unexpected(other),
        }
    }

    /// Ask the node to announce itself now and report newcomers
    pub async fn discover(&mut self) -> Result<Vec<PeerInfo>> {
        match self.send_request(IpcRequest::DiscoverNow).await? {
            IpcResponse::Discovered { peers } => Ok(peers),
            other => unexpected(other),
        }
    }

    pub async fn list_links(&mut self) -> Result<Vec<LinkInfo>> {
        match self.send_request(IpcRequest::ListLinks).await? {
            IpcResponse::Links { links } => Ok(links),
            other => unexpected(other),
        }
    }

    pub async fn check_port(&mut self, port: u16) -> Result<bool> {
        match self.send_request(IpcRequest::CheckPort { port }).await? {
            IpcResponse::PortAvailability { available, .. } => Ok(available),
            other => unexpected(other),
        }
    }

    pub async fn claim_port(
        &mut self,
        port: u16,
        service: &str,
        pid: Option<u32>,
    ) -> Result<PortOutcome> {
        let request = IpcRequest::ClaimPort {
            port,
            service: service.to_string(),
            pid,
        };
        match self.send_request(request).await? {
            IpcResponse::PortOutcome(outcome) => Ok(outcome),
            other => unexpected(other),
        }
    }

    pub async fn release_port(&mut self, port: u16) -> Result<PortOutcome> {
        match self.send_request(IpcRequest::ReleasePort { port }).await? {
            IpcResponse::PortOutcome(outcome) => Ok(outcome),
            other => unexpected(other),
        }
    }

    pub async fn validate_service(
        &mut self,
        service: &str,
        port: Option<u16>,
    ) -> Result<ServiceValidation> {
        let request = IpcRequest::ValidateService {
            service: service.to_string(),
            port,
        };
        match self.send_request(request).await? {
            IpcResponse::Validation(validation) => Ok(validation),
            other => unexpected(other),
        }
    }

    pub async fn port_status(&mut self) -> Result<PortStatusReport> {
        match self.send_request(IpcRequest::GetPortStatus).await? {
            IpcResponse::PortStatus(report) => Ok(report),
            other => unexpected(other),
        }
    }

    /// Start receiving events; read them with `next_event`
    pub async fn subscribe(&mut self) -> Result<()> {
        match self.send_request(IpcRequest::Subscribe).await? {
            IpcResponse::Ok => Ok(()),
            other => unexpected(other),
        }
    }

    /// Next pushed event. `None` once the node closes the connection.
    pub async fn next_event(&mut self) -> Result<Option<NodeEvent>> {
        loop {
            match self.read_message().await? {
                Some(IpcMessage::Event(event)) => return Ok(Some(event)),
                Some(other) => tracing::debug!("Ignoring non-event message: {:?}", other),
                None => return Ok(None),
            }
        }
    }

    /// Ask the node to stop
    pub async fn shutdown(&mut self) -> Result<()> {
        match self.send_request(IpcRequest::Shutdown).await? {
            IpcResponse::Ok => Ok(()),
            other => unexpected(other),
        }
    }

    /// Send a request and wait for its response, skipping pushed events
    async fn send_request(&mut self, request: IpcRequest) -> Result<IpcResponse> {
        self.connect().await?;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Not connected"))?;

        let mut request_json = serde_json::to_string(&request)?;
        request_json.push('\n');
        conn.writer.write_all(request_json.as_bytes()).await?;

        loop {
            match self.read_message().await? {
                Some(IpcMessage::Response(response)) => return Ok(response),
                Some(IpcMessage::Event(_)) => continue,
                Some(IpcMessage::Request(r)) => anyhow::bail!("Unexpected request from node: {:?}", r),
                None => anyhow::bail!("Node closed the connection"),
            }
        }
    }

    async fn read_message(&mut self) -> Result<Option<IpcMessage>> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Not connected"))?;

        let mut line = String::new();
        if conn.reader.read_line(&mut line).await? == 0 {
            self.conn = None;
            return Ok(None);
        }
        let message = IpcMessage::from_bytes(line.trim().as_bytes())
            .with_context(|| format!("Malformed message from node: {}", line.trim()))?;
        Ok(Some(message))
    }
}

/// Errors come back as a response variant; anything else is a bug
fn unexpected<T>(response: IpcResponse) -> Result<T> {
    match response {
        IpcResponse::Error { message } => anyhow::bail!("{}", message),
        other => anyhow::bail!("Unexpected response: {:?}", other),
    }
}
