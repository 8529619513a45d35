//! Presence beacon datagrams
//!
//! A beacon is a single UDP datagram holding one JSON object. It is never
//! stored; receivers fold it into their machine registry and drop it.

use serde::{Deserialize, Serialize};

use crate::advert::MachineAdvert;
use crate::error::ProtocolError;
use crate::message::PROTOCOL_VERSION;

/// Value of the `message_type` field on every beacon
pub const BEACON_TAG: &str = "machine_beacon";

/// Largest datagram a listener will accept
pub const MAX_BEACON_SIZE: usize = 8192;

/// Wire payload of a presence announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconMessage {
    pub message_type: String,
    pub protocol_version: u32,
    #[serde(flatten)]
    pub advert: MachineAdvert,
    /// Sender wall clock, milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Per-sender counter, incremented on every emitted beacon
    #[serde(default)]
    pub sequence: u64,
}

impl BeaconMessage {
    pub fn new(advert: MachineAdvert, timestamp: u64, sequence: u64) -> Self {
        Self {
            message_type: BEACON_TAG.to_string(),
            protocol_version: PROTOCOL_VERSION,
            advert,
            timestamp,
            sequence,
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.advert.machine_id
    }

    /// Serialize into a datagram
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_BEACON_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_BEACON_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Parse and validate a datagram.
    ///
    /// Rejects anything that is not a beacon, has an empty machine id, or
    /// advertises a protocol version other than ours.
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        if datagram.len() > MAX_BEACON_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: datagram.len(),
                max: MAX_BEACON_SIZE,
            });
        }

        let beacon: BeaconMessage = serde_json::from_slice(datagram)?;

        if beacon.message_type != BEACON_TAG {
            return Err(ProtocolError::InvalidBeacon(format!(
                "unexpected message_type {:?}",
                beacon.message_type
            )));
        }
        if beacon.advert.machine_id.trim().is_empty() {
            return Err(ProtocolError::InvalidBeacon("empty machine_id".into()));
        }
        if beacon.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: beacon.protocol_version,
            });
        }

        Ok(beacon)
    }
}
