//! IPC client for communicating with the node daemon
//!
//! Uses TCP on localhost, see `sk_core::ipc` for the message set.

mod client;

pub use client::{resolve_ipc_address, NodeClient, IPC_ADDR_ENV};

pub use sk_core::ipc::{LinkInfo, NodeEvent, NodeStatus, PeerInfo};
