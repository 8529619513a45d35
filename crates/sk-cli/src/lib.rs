//! skein: command-line interface for the skein node
//!
//! Runs the node daemon (`skein serve`) and talks to a running node over
//! its local IPC port for everything else.

pub mod commands;
pub mod ipc;
pub mod output;
