//! IPC protocol for CLI to node communication
//!
//! Uses newline-delimited JSON messages over TCP on localhost (127.0.0.1).
//! Every request gets exactly one response; after `subscribe` the server
//! additionally pushes `NodeEvent`s on the same connection.

use serde::{Deserialize, Serialize};

use crate::ports::{PortAllocation, PortOutcome, PortStatusReport, ServiceValidation};
use crate::types::{LinkDirection, LinkState, MachineDescriptor};

/// IPC request from client to node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Ping (for keepalive)
    Ping,

    /// Get node and cluster status
    GetStatus,

    /// List every known machine with its link state
    ListPeers,

    /// Get one known machine
    GetPeer { machine_id: String },

    /// Broadcast now and report peers seen during the discovery window
    DiscoverNow,

    /// List cluster links
    ListLinks,

    /// Is the port bindable right now
    CheckPort { port: u16 },

    /// Claim a port for a service
    ClaimPort {
        port: u16,
        service: String,
        #[serde(default)]
        pid: Option<u32>,
    },

    /// Release an active claim
    ReleasePort { port: u16 },

    /// Check a service/port pair without claiming
    ValidateService {
        service: String,
        #[serde(default)]
        port: Option<u16>,
    },

    /// Snapshot of the port table
    GetPortStatus,

    /// Receive node events on this connection
    Subscribe,

    /// Stop the node
    Shutdown,
}

/// IPC response from node to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Pong response
    Pong,

    /// Node status
    Status(NodeStatus),

    /// Known machines
    Peers { peers: Vec<PeerInfo> },

    /// Single machine
    Peer(PeerInfo),

    /// Machines first seen during an on-demand discovery
    Discovered { peers: Vec<PeerInfo> },

    /// Cluster links
    Links { links: Vec<LinkInfo> },

    /// Result of a port check
    PortAvailability { port: u16, available: bool },

    /// Result of a claim or release
    PortOutcome(PortOutcome),

    /// Result of a service validation
    Validation(ServiceValidation),

    /// Port table snapshot
    PortStatus(PortStatusReport),

    /// Generic success
    Ok,

    /// Error response
    Error { message: String },
}

/// Event pushed from the node to subscribed clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEvent {
    /// A machine was seen for the first time, or came back from offline
    PeerDiscovered(PeerInfo),

    /// A machine went silent past the silence window
    PeerOffline { machine_id: String },

    /// Two different machines claimed the same machine id
    PeerAnomaly { machine_id: String, detail: String },

    /// A link changed state
    LinkStateChanged {
        link_id: u64,
        machine_id: Option<String>,
        state: LinkState,
    },

    /// Pass-through status payload from a peer
    StatusUpdate {
        machine_id: String,
        payload: serde_json::Value,
    },

    /// Opaque task payload from a peer
    TaskCoordination {
        machine_id: String,
        payload: serde_json::Value,
    },

    /// A port was claimed
    PortClaimed(PortAllocation),

    /// A port claim was released
    PortReleased { port: u16, service: String },
}

/// A known machine together with the state of its link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(flatten)]
    pub descriptor: MachineDescriptor,
    /// State of the best link to this machine
    pub link_state: LinkState,
    /// This entry describes the local node
    #[serde(default)]
    pub is_local: bool,
}

/// One cluster link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub link_id: u64,
    /// Known once the handshake completes
    pub machine_id: Option<String>,
    pub remote_addr: String,
    pub direction: LinkDirection,
    pub state: LinkState,
    /// Unix milliseconds
    pub established_at: Option<u64>,
    /// Last measured ping round trip
    pub rtt_ms: Option<u64>,
}

/// Link counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCounts {
    pub connecting: usize,
    pub handshake_pending: usize,
    pub established: usize,
    pub degraded: usize,
}

impl LinkCounts {
    pub fn record(&mut self, state: LinkState) {
        match state {
            LinkState::Connecting => self.connecting += 1,
            LinkState::HandshakePending => self.handshake_pending += 1,
            LinkState::Established => self.established += 1,
            LinkState::Degraded => self.degraded += 1,
            LinkState::Disconnected | LinkState::Closed => {}
        }
    }
}

/// Node and cluster status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub machine_id: String,
    pub hostname: String,
    pub primary_ip: String,
    pub version: String,
    pub uptime_secs: u64,
    pub beacon_port: u16,
    pub cluster_port: u16,
    /// Remote machines currently online or degraded
    pub peers_online: usize,
    /// Remote machines ever seen
    pub peers_total: usize,
    pub links: LinkCounts,
    /// CPU cores across present machines, local included
    pub cluster_cpu_cores: u64,
    /// Memory across present machines, local included
    pub cluster_memory_mb: u64,
    pub reserved_ports: usize,
    pub active_claims: usize,
}

/// IPC message wrapper (for framing)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpcMessage {
    Request(IpcRequest),
    Response(IpcResponse),
    Event(NodeEvent),
}

impl IpcMessage {
    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl From<IpcRequest> for IpcMessage {
    fn from(req: IpcRequest) -> Self {
        IpcMessage::Request(req)
    }
}

impl From<IpcResponse> for IpcMessage {
    fn from(resp: IpcResponse) -> Self {
        IpcMessage::Response(resp)
    }
}

impl From<NodeEvent> for IpcMessage {
    fn from(event: NodeEvent) -> Self {
        IpcMessage::Event(event)
    }
}
