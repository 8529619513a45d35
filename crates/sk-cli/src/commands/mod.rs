//! CLI command implementations

mod config;
mod peers;
mod ports;
mod status;
mod watch;

pub use config::{config_get, config_init, config_show};
pub use peers::{discover_command, links_command, peer_command, peers_command};
pub use ports::{
    ports_check, ports_claim, ports_release, ports_status, ports_validate,
};
pub use status::status_command;
pub use watch::watch_command;
