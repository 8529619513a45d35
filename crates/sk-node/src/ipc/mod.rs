//! IPC server for CLI communication
//!
//! Local clients (the `skein` CLI, scripts) talk to a running node over
//! newline-delimited JSON on a loopback TCP port.

mod server;

pub use server::IpcServer;
