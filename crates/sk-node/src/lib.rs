//! sk-node: LAN machine discovery and cluster coordination
//!
//! A node announces itself with UDP beacons, listens for everyone else's,
//! keeps a registry of known machines with liveness expiry, holds one
//! cluster link per peer, and arbitrates local port ownership. The
//! `DiscoveryCoordinator` wires these together; the IPC server exposes
//! them to the CLI.

pub mod coordinator;
pub mod discovery;
pub mod identity;
pub mod ipc;
pub mod link;
pub mod ports;
pub mod registry;
pub mod state;
pub mod tasks;

pub use coordinator::DiscoveryCoordinator;
pub use identity::{AdvertSource, LocalIdentity};
pub use registry::MachineRegistry;
pub use state::NodeState;
