//! Node configuration

use serde::{Deserialize, Serialize};
use sk_protocol::ServiceEndpoint;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use super::{ClusterConfig, DiscoveryConfig, PortsConfig};
use crate::error::ConfigError;
use crate::ports::PortCategory;

/// Complete configuration for one skein node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub discovery: DiscoveryConfig,
    pub cluster: ClusterConfig,
    pub ports: PortsConfig,
}

/// Identity and local surface of the node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Fixed machine id; a fresh one is generated per process when unset
    pub machine_id: Option<String>,

    /// Hostname to advertise instead of the OS hostname
    pub alias: Option<String>,

    /// IP to advertise instead of the detected primary address
    pub advertise_ip: Option<String>,

    /// Services advertised regardless of port claims
    pub services: Vec<ServiceEndpoint>,

    /// IPC port for CLI communication (localhost only)
    pub ipc_port: u16,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            machine_id: None,
            alias: None,
            advertise_ip: None,
            services: Vec::new(),
            ipc_port: 22240,
        }
    }
}

impl NodeConfig {
    /// Load from `path`, or from the default location.
    ///
    /// A missing file at the default location yields the defaults; a
    /// missing file that was asked for explicitly is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: NodeConfig = match path {
            Some(path) => super::load_config(path)?,
            None => {
                let default_path = super::default_config_path();
                if default_path.exists() {
                    super::load_config(&default_path)?
                } else {
                    tracing::debug!("No config at {:?}, using defaults", default_path);
                    NodeConfig::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Get the IPC address (localhost:port)
    pub fn ipc_address(&self) -> String {
        format!("127.0.0.1:{}", self.node.ipc_port)
    }

    /// Reject configurations the node cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.discovery;
        non_zero("discovery.interval", d.interval)?;
        non_zero("discovery.silence_window", d.silence_window)?;
        non_zero("discovery.sweep_interval", d.sweep_interval)?;
        non_zero("discovery.discover_window", d.discover_window)?;
        if d.silence_window <= d.interval {
            return Err(ConfigError::Invalid(format!(
                "discovery.silence_window ({:?}) must exceed discovery.interval ({:?})",
                d.silence_window, d.interval
            )));
        }
        if d.beacon_port == 0 {
            return Err(ConfigError::Invalid("discovery.beacon_port must not be 0".into()));
        }

        let c = &self.cluster;
        non_zero("cluster.heartbeat_interval", c.heartbeat_interval)?;
        non_zero("cluster.handshake_timeout", c.handshake_timeout)?;
        non_zero("cluster.connect_timeout", c.connect_timeout)?;
        non_zero("cluster.shutdown_timeout", c.shutdown_timeout)?;

        let b = &c.backoff;
        non_zero("cluster.backoff.initial", b.initial)?;
        if b.initial > b.max {
            return Err(ConfigError::Invalid(
                "cluster.backoff.initial must not exceed cluster.backoff.max".into(),
            ));
        }
        if !(b.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(
                "cluster.backoff.multiplier must be at least 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&b.jitter) {
            return Err(ConfigError::Invalid(
                "cluster.backoff.jitter must be between 0.0 and 1.0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for reserved in &self.ports.reserved {
            if reserved.port == 0 {
                return Err(ConfigError::Invalid("ports.reserved contains port 0".into()));
            }
            if reserved.service.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "ports.reserved entry for port {} has no service name",
                    reserved.port
                )));
            }
            if !seen.insert(reserved.port) {
                return Err(ConfigError::Invalid(format!(
                    "ports.reserved lists port {} more than once",
                    reserved.port
                )));
            }
        }

        for category in PortCategory::ALL {
            let matching: Vec<_> = self
                .ports
                .ranges
                .iter()
                .filter(|r| r.category == category)
                .collect();
            match matching.as_slice() {
                [range] => {
                    if range.start == 0 || range.start > range.end {
                        return Err(ConfigError::Invalid(format!(
                            "ports.ranges for {} is empty or starts at 0 ({}-{})",
                            category, range.start, range.end
                        )));
                    }
                }
                [] => return Err(ConfigError::MissingField(format!("ports.ranges.{}", category))),
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "ports.ranges has more than one range for {}",
                        category
                    )))
                }
            }
        }

        Ok(())
    }
}

fn non_zero(name: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
    }
    Ok(())
}
