//! sk-core: Core types, errors and configuration for skein
//!
//! This crate provides the domain types shared by the node daemon and the
//! CLI: machine descriptors, link states, port allocations, the error
//! taxonomy, configuration and the local IPC vocabulary.

pub mod config;
pub mod error;
pub mod ipc;
pub mod ports;
pub mod time;
pub mod types;

pub use error::{ConfigError, LinkError, PortError, SkError};
pub use types::{LinkDirection, LinkState, MachineDescriptor, MachineId, MachineStatus};
