//! Port table configuration

use serde::{Deserialize, Serialize};

use crate::ports::{CategoryRange, PortCategory};

/// Service name under which the cluster link listener claims its port
pub const CLUSTER_SERVICE: &str = "cluster-communication";

/// One row of the static reserved table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedPort {
    pub port: u16,
    pub service: String,
}

impl ReservedPort {
    pub fn new(port: u16, service: impl Into<String>) -> Self {
        Self {
            port,
            service: service.into(),
        }
    }
}

/// Reserved table and suggestion ranges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Ports permanently bound to a named infrastructure service
    pub reserved: Vec<ReservedPort>,

    /// Suggestion range per service category
    pub ranges: Vec<CategoryRange>,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            reserved: vec![
                ReservedPort::new(8080, CLUSTER_SERVICE),
                ReservedPort::new(5432, "postgresql"),
                ReservedPort::new(6379, "redis"),
                ReservedPort::new(8086, "influxdb"),
                ReservedPort::new(9090, "prometheus"),
                ReservedPort::new(3000, "grafana"),
                ReservedPort::new(8000, "api-gateway"),
            ],
            ranges: vec![
                CategoryRange::new(PortCategory::Web, 8091, 8099),
                CategoryRange::new(PortCategory::Api, 8001, 8089),
                CategoryRange::new(PortCategory::Tool, 8100, 8199),
                CategoryRange::new(PortCategory::Generic, 8200, 8999),
            ],
        }
    }
}

impl PortsConfig {
    /// Range configured for a category
    pub fn range_for(&self, category: PortCategory) -> Option<CategoryRange> {
        self.ranges.iter().copied().find(|r| r.category == category)
    }
}
