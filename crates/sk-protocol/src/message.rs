//! Message types for the cluster link protocol
//!
//! Every frame on a cluster link carries one `ClusterMessage` envelope:
//!
//! ```json
//! {"type": "heartbeat", "source_machine_id": "m-aaa", "payload": null, "timestamp": 1700000000000}
//! ```
//!
//! # Message Flow
//!
//! 1. Both sides send `registration` immediately after the TCP connection
//!    is up, carrying their full advert and protocol version
//! 2. Each side waits for the other's `registration` before treating the
//!    link as established
//! 3. `heartbeat` is sent periodically by both sides
//! 4. `ping`/`pong`, `peer_query`/`peer_list` and
//!    `service_query`/`service_response` are request/reply pairs
//! 5. `status_update` and `task_coordination` are delivered as-is; the
//!    link does not interpret their payloads

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::advert::MachineAdvert;
use crate::error::ProtocolError;

/// Current protocol version.
///
/// Sent in every beacon and registration. Peers with a different version
/// are never promoted to an established link.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MessageType {
    /// Descriptor exchange, first message in each direction
    Registration = 0x01,
    /// Liveness signal
    Heartbeat = 0x02,
    /// Pass-through metrics payload
    StatusUpdate = 0x03,
    /// Opaque payload reserved for task distribution
    TaskCoordination = 0x04,
    /// Latency probe
    Ping = 0x05,
    /// Latency probe reply
    Pong = 0x06,
    /// Request for the peer's view of online machines
    PeerQuery = 0x07,
    /// Reply to `PeerQuery`
    PeerList = 0x08,
    /// Where does a named service live
    ServiceQuery = 0x09,
    /// Reply to `ServiceQuery`
    ServiceResponse = 0x0A,
    /// Error notification, usually followed by a close
    Error = 0xFF,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Registration),
            0x02 => Some(Self::Heartbeat),
            0x03 => Some(Self::StatusUpdate),
            0x04 => Some(Self::TaskCoordination),
            0x05 => Some(Self::Ping),
            0x06 => Some(Self::Pong),
            0x07 => Some(Self::PeerQuery),
            0x08 => Some(Self::PeerList),
            0x09 => Some(Self::ServiceQuery),
            0x0A => Some(Self::ServiceResponse),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes carried in `error` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Peer's protocol version is not supported
    VersionMismatch,
    /// Peer identified as someone other than expected
    UnexpectedPeer,
    /// Peer connected to itself
    SelfConnection,
    /// Message could not be understood
    InvalidMessage,
}

/// Payload of a `registration` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub protocol_version: u32,
    #[serde(flatten)]
    pub advert: MachineAdvert,
}

impl Registration {
    pub fn new(advert: MachineAdvert) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            advert,
        }
    }
}

/// Payload of `ping` and `pong`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    /// Echoed back unchanged in the `pong`
    pub nonce: u64,
}

/// Payload of `peer_list`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListPayload {
    pub peers: Vec<MachineAdvert>,
}

/// Payload of `service_query`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceQueryPayload {
    pub service: String,
}

/// Payload of `service_response`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceResponsePayload {
    pub service: String,
    /// None when the peer does not host the service
    pub port: Option<u16>,
}

/// Payload of `error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Envelope for every message on a cluster link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub source_machine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_machine_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Sender wall clock, milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl ClusterMessage {
    /// Build an envelope around an already-encoded payload
    pub fn new(
        kind: MessageType,
        source_machine_id: impl Into<String>,
        payload: serde_json::Value,
        timestamp: u64,
    ) -> Self {
        Self {
            kind,
            source_machine_id: source_machine_id.into(),
            target_machine_id: None,
            payload,
            timestamp,
        }
    }

    /// Build an envelope around a typed payload
    pub fn with_payload<T: Serialize>(
        kind: MessageType,
        source_machine_id: impl Into<String>,
        payload: &T,
        timestamp: u64,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            kind,
            source_machine_id,
            serde_json::to_value(payload)?,
            timestamp,
        ))
    }

    pub fn registration(
        source_machine_id: impl Into<String>,
        registration: &Registration,
        timestamp: u64,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(
            MessageType::Registration,
            source_machine_id,
            registration,
            timestamp,
        )
    }

    /// Heartbeats carry no payload
    pub fn heartbeat(source_machine_id: impl Into<String>, timestamp: u64) -> Self {
        Self::new(
            MessageType::Heartbeat,
            source_machine_id,
            serde_json::Value::Null,
            timestamp,
        )
    }

    /// Address the envelope to one machine
    pub fn to(mut self, target_machine_id: impl Into<String>) -> Self {
        self.target_machine_id = Some(target_machine_id.into());
        self
    }

    /// Decode the payload as a typed value
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advert::ServiceEndpoint;

    #[test]
    fn test_message_type_roundtrip() {
        for msg_type in [
            MessageType::Registration,
            MessageType::Heartbeat,
            MessageType::StatusUpdate,
            MessageType::TaskCoordination,
            MessageType::Ping,
            MessageType::Pong,
            MessageType::PeerQuery,
            MessageType::PeerList,
            MessageType::ServiceQuery,
            MessageType::ServiceResponse,
            MessageType::Error,
        ] {
            let byte = msg_type.as_u8();
            let recovered = MessageType::from_u8(byte).unwrap();
            assert_eq!(recovered, msg_type);
        }
        assert!(MessageType::from_u8(0x00).is_none());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let msg = ClusterMessage::heartbeat("m-aaa", 42).to("m-bbb");
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["source_machine_id"], "m-aaa");
        assert_eq!(json["target_machine_id"], "m-bbb");
        assert!(json["payload"].is_null());
        assert_eq!(json["timestamp"], 42);
    }

    #[test]
    fn test_registration_payload_is_flat() {
        let reg = Registration::new(MachineAdvert {
            machine_id: "m-aaa".into(),
            hostname: "alpha".into(),
            primary_ip: "10.0.0.1".into(),
            services: vec![ServiceEndpoint::new("dashboard", 8090)],
            cluster_port: 8080,
            capabilities: None,
        });
        let msg = ClusterMessage::registration("m-aaa", &reg, 1).unwrap();

        assert_eq!(msg.payload["protocol_version"], PROTOCOL_VERSION);
        assert_eq!(msg.payload["machine_id"], "m-aaa");

        let back: Registration = msg.decode_payload().unwrap();
        assert_eq!(back, reg);
    }

    #[test]
    fn test_opaque_payload_passes_through() {
        let raw = r#"{"type":"task_coordination","source_machine_id":"m-b",
            "payload":{"anything":[1,2,3]},"timestamp":9}"#;
        let msg: ClusterMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, MessageType::TaskCoordination);
        assert_eq!(msg.payload["anything"][2], 3);
        assert!(msg.target_machine_id.is_none());
    }

    #[test]
    fn test_decode_payload_wrong_shape() {
        let msg = ClusterMessage::heartbeat("m-a", 0);
        assert!(msg.decode_payload::<PingPayload>().is_err());
    }
}
