//! sk-protocol: Wire protocol for skein machine discovery
//!
//! This crate defines the two wire formats spoken between skein nodes:
//! the UDP presence beacon and the framed JSON envelope carried over a
//! persistent cluster link.

pub mod advert;
pub mod beacon;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use advert::{Capabilities, MachineAdvert, ServiceEndpoint};
pub use beacon::{BeaconMessage, BEACON_TAG, MAX_BEACON_SIZE};
pub use codec::ClusterCodec;
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{
    ClusterMessage, ErrorCode, ErrorPayload, MessageType, PeerListPayload, PingPayload,
    Registration, ServiceQueryPayload, ServiceResponsePayload, PROTOCOL_VERSION,
};
