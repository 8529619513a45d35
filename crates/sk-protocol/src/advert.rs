//! Machine advertisement shared by beacons and registrations

use serde::{Deserialize, Serialize};

/// A named service listening on a port of the advertising machine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Service name, unique per machine
    pub name: String,
    /// TCP port the service listens on
    pub port: u16,
}

impl ServiceEndpoint {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

/// Optional resource hints about the advertising machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Logical CPU cores
    pub cpu_cores: u32,
    /// Total physical memory in MiB
    pub memory_total_mb: u64,
}

/// Everything a machine says about itself on the wire.
///
/// Carried flattened inside both `BeaconMessage` and the `registration`
/// payload, so the field names here are the wire names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineAdvert {
    pub machine_id: String,
    pub hostname: String,
    pub primary_ip: String,
    #[serde(default)]
    pub services: Vec<ServiceEndpoint>,
    /// Port of the cluster link listener
    #[serde(rename = "websocket_port")]
    pub cluster_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
}

impl MachineAdvert {
    /// Look up an advertised service by name
    pub fn service(&self, name: &str) -> Option<&ServiceEndpoint> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Drop later services that reuse an earlier name.
    ///
    /// Service names are unique per machine; the first occurrence wins.
    pub fn dedup_services(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.services.retain(|s| seen.insert(s.name.clone()));
    }
}
