//! Core domain types

use serde::{Deserialize, Serialize};
use sk_protocol::{Capabilities, MachineAdvert, ServiceEndpoint};
use std::fmt;

/// Unique identifier for a machine.
///
/// Generated once per process instance and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(pub String);

impl MachineId {
    /// Create a new machine ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random machine ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MachineId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Liveness of a machine as seen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    /// Recently heard from
    Online,
    /// Still considered present, but its link missed heartbeats
    Degraded,
    /// Silent for longer than the silence window
    Offline,
}

impl MachineStatus {
    /// Online and degraded machines both count as present
    pub fn is_present(&self) -> bool {
        matches!(self, MachineStatus::Online | MachineStatus::Degraded)
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineStatus::Online => write!(f, "online"),
            MachineStatus::Degraded => write!(f, "degraded"),
            MachineStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A known machine, local or remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDescriptor {
    pub machine_id: MachineId,
    pub hostname: String,
    pub primary_ip: String,
    pub services: Vec<ServiceEndpoint>,
    #[serde(rename = "websocket_port")]
    pub cluster_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    /// Last contact, Unix milliseconds
    pub last_seen: u64,
    pub status: MachineStatus,
}

impl MachineDescriptor {
    /// Build an online descriptor from a wire advert
    pub fn from_advert(advert: MachineAdvert, seen_at: u64) -> Self {
        let mut advert = advert;
        advert.dedup_services();
        Self {
            machine_id: MachineId(advert.machine_id),
            hostname: advert.hostname,
            primary_ip: advert.primary_ip,
            services: advert.services,
            cluster_port: advert.cluster_port,
            capabilities: advert.capabilities,
            last_seen: seen_at,
            status: MachineStatus::Online,
        }
    }

    /// Wire form of this descriptor
    pub fn to_advert(&self) -> MachineAdvert {
        MachineAdvert {
            machine_id: self.machine_id.0.clone(),
            hostname: self.hostname.clone(),
            primary_ip: self.primary_ip.clone(),
            services: self.services.clone(),
            cluster_port: self.cluster_port,
            capabilities: self.capabilities,
        }
    }

    /// Address of the peer's cluster link listener
    pub fn cluster_address(&self) -> String {
        format!("{}:{}", self.primary_ip, self.cluster_port)
    }
}

/// State of one cluster link.
///
/// ```text
/// Disconnected -> Connecting -> HandshakePending -> Established <-> Degraded
///       \______________\_______________\________________\___________\-> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    HandshakePending,
    Established,
    /// Heartbeats missed; socket still open
    Degraded,
    Closed,
}

impl LinkState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: LinkState) -> bool {
        use LinkState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, HandshakePending) => true,
            (HandshakePending, Established) => true,
            (Established, Degraded) => true,
            (Degraded, Established) => true,
            _ => false,
        }
    }

    /// Connecting, handshaking or open; the coordinator must not dial
    /// another link while one of these exists
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            LinkState::Connecting
                | LinkState::HandshakePending
                | LinkState::Established
                | LinkState::Degraded
        )
    }

    /// A socket exists and the handshake completed
    pub fn is_open(&self) -> bool {
        matches!(self, LinkState::Established | LinkState::Degraded)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::HandshakePending => "handshake_pending",
            LinkState::Established => "established",
            LinkState::Degraded => "degraded",
            LinkState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Which side opened the TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkDirection {
    /// We dialed the peer
    Outbound,
    /// The peer dialed us
    Inbound,
}

impl fmt::Display for LinkDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkDirection::Outbound => write!(f, "outbound"),
            LinkDirection::Inbound => write!(f, "inbound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(MachineId::generate(), MachineId::generate());
    }

    #[test]
    fn test_machine_id_is_transparent() {
        let json = serde_json::to_string(&MachineId::new("m-aaa")).unwrap();
        assert_eq!(json, "\"m-aaa\"");
    }

    #[test]
    fn test_link_state_happy_path() {
        use LinkState::*;
        let path = [Disconnected, Connecting, HandshakePending, Established, Degraded, Established, Closed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_link_state_illegal_moves() {
        use LinkState::*;
        assert!(!Connecting.can_transition_to(Established));
        assert!(!Disconnected.can_transition_to(HandshakePending));
        assert!(!HandshakePending.can_transition_to(Degraded));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_link_state_liveness() {
        assert!(LinkState::Connecting.is_live());
        assert!(LinkState::Degraded.is_live());
        assert!(!LinkState::Closed.is_live());
        assert!(!LinkState::Disconnected.is_live());
        assert!(!LinkState::HandshakePending.is_open());
        assert!(LinkState::Degraded.is_open());
    }

    #[test]
    fn test_descriptor_from_advert() {
        let advert = MachineAdvert {
            machine_id: "m-aaa".into(),
            hostname: "alpha".into(),
            primary_ip: "10.1.2.3".into(),
            services: vec![ServiceEndpoint::new("dashboard", 8090)],
            cluster_port: 8080,
            capabilities: None,
        };
        let d = MachineDescriptor::from_advert(advert.clone(), 99);
        assert_eq!(d.status, MachineStatus::Online);
        assert_eq!(d.last_seen, 99);
        assert_eq!(d.cluster_address(), "10.1.2.3:8080");
        assert_eq!(d.to_advert(), advert);
    }
}
