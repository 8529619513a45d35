//! Cluster links
//!
//! One persistent, framed TCP connection per peer, carrying
//! `ClusterMessage`s after a mutual registration handshake.

pub mod backoff;
pub mod connection;
pub mod pool;
pub mod server;

pub use backoff::ExponentialBackoff;
pub use connection::run_link;
pub use pool::{CloseReason, LinkCommand, LinkHandle, LinkId, LinkPool};
pub use server::{LinkClosed, LinkServer, LinkSpawner};
