//! Core error types for skein

use sk_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the skein crates
#[derive(Error, Debug)]
pub enum SkError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Cluster link error
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Port arbitration error
    #[error("Port error: {0}")]
    Port(#[from] PortError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation needs a started coordinator
    #[error("Discovery is not running")]
    NotRunning,
}

/// Cluster link errors.
///
/// These are transient: the coordinator retries with back-off and never
/// surfaces them as hard failures.
#[derive(Error, Debug)]
pub enum LinkError {
    /// TCP connect failed
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// TCP connect did not finish in time
    #[error("Connect to {0} timed out")]
    ConnectTimeout(String),

    /// Connection dropped
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Peer never sent its registration
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// Peer sent something other than a registration first
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer turned out to be a different machine than dialed
    #[error("Expected peer {expected}, got {actual}")]
    UnexpectedPeer { expected: String, actual: String },

    /// Peer turned out to be ourselves
    #[error("Refusing link to self")]
    SelfConnection,

    /// Link is already closed
    #[error("Link closed")]
    Closed,

    /// No link to the requested machine
    #[error("No link to machine: {0}")]
    NoLink(String),
}

/// Port arbitration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Port belongs to a different reserved service
    #[error("Port {port} is reserved for {owner}. Cannot use for {service}.")]
    ReservedForOther {
        port: u16,
        owner: String,
        service: String,
    },

    /// Port is actively claimed by a different service
    #[error("Port {port} is already claimed by {owner}. Cannot use for {service}.")]
    ClaimedByOther {
        port: u16,
        owner: String,
        service: String,
    },

    /// Port is bound at the OS level by someone else
    #[error("{}", in_use_message(.port, .process, .pid))]
    InUse {
        port: u16,
        process: Option<String>,
        pid: Option<u32>,
    },

    /// Bind test failed for a reason other than "in use"
    #[error("Port {port} is unavailable: {reason}")]
    Unavailable { port: u16, reason: String },

    /// Reserved ports can never be released
    #[error("Port {port} is reserved for {owner} and cannot be released")]
    ReservedRelease { port: u16, owner: String },

    /// Nothing to release
    #[error("Port {0} is not allocated")]
    NotAllocated(u16),

    /// Every port in the category range is taken
    #[error("No free port in range {start}-{end} for {service}")]
    RangeExhausted { service: String, start: u16, end: u16 },

    /// Port 0 is never claimable
    #[error("Port 0 cannot be claimed")]
    InvalidPort,
}

fn in_use_message(port: &u16, process: &Option<String>, pid: &Option<u32>) -> String {
    match (process, pid) {
        (Some(name), Some(pid)) => format!("Port {port} is already in use by {name} (PID: {pid})"),
        (None, Some(pid)) => format!("Port {port} is already in use (PID: {pid})"),
        _ => format!("Port {port} is already in use"),
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
