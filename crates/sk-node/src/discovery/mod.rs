//! Beacon discovery
//!
//! Presence is announced with periodic UDP beacons to a multicast group,
//! the broadcast addresses and any configured unicast targets. Every node
//! listens on the same port and feeds what it hears into the registry.

pub mod broadcaster;
pub mod listener;
mod socket;

pub use broadcaster::{resolve_targets, BeaconBroadcaster};
pub use listener::{BeaconListener, ReceivedBeacon};
