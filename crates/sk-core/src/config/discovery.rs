//! Beacon discovery configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration;

/// Settings for the beacon broadcaster, listener and registry sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// UDP port beacons are sent to and received on
    pub beacon_port: u16,

    /// Address the listener binds to
    pub bind_address: String,

    /// Multicast group to join and announce to (None disables multicast)
    pub multicast_group: Option<String>,

    /// Announce to the limited broadcast address 255.255.255.255
    pub broadcast: bool,

    /// Announce to the /24 broadcast address of the primary IP
    pub subnet_broadcast: bool,

    /// Extra `host:port` targets, e.g. unicast peers on other subnets
    pub targets: Vec<String>,

    /// Time between beacons
    #[serde(with = "duration")]
    pub interval: Duration,

    /// Silence after which a peer is marked offline
    #[serde(with = "duration")]
    pub silence_window: Duration,

    /// Time between registry expiry sweeps
    #[serde(with = "duration")]
    pub sweep_interval: Duration,

    /// Extra listening time for an on-demand discovery
    #[serde(with = "duration")]
    pub discover_window: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            beacon_port: 8181,
            bind_address: "0.0.0.0".to_string(),
            multicast_group: Some("239.255.43.21".to_string()),
            broadcast: true,
            subnet_broadcast: true,
            targets: Vec::new(),
            interval: Duration::from_secs(15),
            silence_window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(15),
            discover_window: Duration::from_secs(3),
        }
    }
}

impl DiscoveryConfig {
    /// Listener bind address as `host:port`
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.beacon_port)
    }
}
