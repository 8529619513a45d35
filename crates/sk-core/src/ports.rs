//! Port arbitration types
//!
//! The port table has two tiers: reserved allocations, loaded once from
//! configuration and immutable afterwards, and active allocations granted
//! and revoked at runtime. Lookups always consult the reserved tier first.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tier of a port allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    /// From the static table; never released
    Reserved,
    /// Claimed at runtime
    Active,
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationStatus::Reserved => write!(f, "reserved"),
            AllocationStatus::Active => write!(f, "active"),
        }
    }
}

/// One row of the port table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub port: u16,
    pub service: String,
    pub status: AllocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// When the allocation was made, Unix milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
}

impl PortAllocation {
    pub fn reserved(port: u16, service: impl Into<String>) -> Self {
        Self {
            port,
            service: service.into(),
            status: AllocationStatus::Reserved,
            pid: None,
            start_time: None,
        }
    }

    pub fn active(port: u16, service: impl Into<String>, pid: Option<u32>, start_time: u64) -> Self {
        Self {
            port,
            service: service.into(),
            status: AllocationStatus::Active,
            pid,
            start_time: Some(start_time),
        }
    }
}

/// Service family used to pick a suggestion range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortCategory {
    /// Web UIs and dashboards
    Web,
    /// HTTP/RPC APIs
    Api,
    /// Tool servers and agents
    Tool,
    /// Everything else
    Generic,
}

impl PortCategory {
    /// All categories in match priority order
    pub const ALL: [PortCategory; 4] = [
        PortCategory::Web,
        PortCategory::Api,
        PortCategory::Tool,
        PortCategory::Generic,
    ];

    /// Classify a service by substring of its name.
    ///
    /// Checked in order, first hit wins: "web"/"dashboard", "api",
    /// "mcp"/"tool"/"agent".
    pub fn from_service(service: &str) -> Self {
        let name = service.to_ascii_lowercase();
        if name.contains("web") || name.contains("dashboard") {
            PortCategory::Web
        } else if name.contains("api") {
            PortCategory::Api
        } else if name.contains("mcp") || name.contains("tool") || name.contains("agent") {
            PortCategory::Tool
        } else {
            PortCategory::Generic
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PortCategory::Web => "web",
            PortCategory::Api => "api",
            PortCategory::Tool => "tool",
            PortCategory::Generic => "generic",
        }
    }
}

impl fmt::Display for PortCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive port range for one category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRange {
    pub category: PortCategory,
    pub start: u16,
    pub end: u16,
}

impl CategoryRange {
    pub fn new(category: PortCategory, start: u16, end: u16) -> Self {
        Self {
            category,
            start,
            end,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Result of a claim or release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOutcome {
    pub success: bool,
    pub port: u16,
    pub message: String,
    /// Alternative port when the request was rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<u16>,
    /// The allocation granted, on a successful claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<PortAllocation>,
}

impl PortOutcome {
    pub fn granted(allocation: PortAllocation, message: impl Into<String>) -> Self {
        Self {
            success: true,
            port: allocation.port,
            message: message.into(),
            suggestion: None,
            allocation: Some(allocation),
        }
    }

    pub fn ok(port: u16, message: impl Into<String>) -> Self {
        Self {
            success: true,
            port,
            message: message.into(),
            suggestion: None,
            allocation: None,
        }
    }

    pub fn rejected(port: u16, message: impl Into<String>, suggestion: Option<u16>) -> Self {
        Self {
            success: false,
            port,
            message: message.into(),
            suggestion,
            allocation: None,
        }
    }
}

/// Answer to "may this service use this port" without claiming anything
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceValidation {
    pub service: String,
    pub category: PortCategory,
    /// Port asked about, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_port: Option<u16>,
    /// Whether the requested port is usable
    pub valid: bool,
    /// Port the service should use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub message: String,
}

/// Snapshot of the port table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatusReport {
    pub reserved: Vec<PortAllocation>,
    pub active: Vec<PortAllocation>,
    pub ranges: Vec<CategoryRange>,
}

impl PortStatusReport {
    /// Owner of `port`, reserved tier first
    pub fn owner_of(&self, port: u16) -> Option<&PortAllocation> {
        self.reserved
            .iter()
            .chain(self.active.iter())
            .find(|a| a.port == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_matching() {
        assert_eq!(PortCategory::from_service("analytics-dashboard"), PortCategory::Web);
        assert_eq!(PortCategory::from_service("webhooks"), PortCategory::Web);
        assert_eq!(PortCategory::from_service("api-gateway"), PortCategory::Api);
        assert_eq!(PortCategory::from_service("mcp-metrics"), PortCategory::Tool);
        assert_eq!(PortCategory::from_service("build-agent"), PortCategory::Tool);
        assert_eq!(PortCategory::from_service("postgres"), PortCategory::Generic);
        // Web wins over api when both appear
        assert_eq!(PortCategory::from_service("web-api"), PortCategory::Web);
        assert_eq!(PortCategory::from_service("Dashboard"), PortCategory::Web);
    }

    #[test]
    fn test_range_is_inclusive() {
        let r = CategoryRange::new(PortCategory::Web, 8091, 8099);
        assert!(r.contains(8091));
        assert!(r.contains(8099));
        assert!(!r.contains(8090));
        assert!(!r.contains(8100));
    }

    #[test]
    fn test_owner_lookup_prefers_reserved() {
        let report = PortStatusReport {
            reserved: vec![PortAllocation::reserved(5432, "postgresql")],
            active: vec![PortAllocation::active(8090, "dashboard", None, 1)],
            ranges: vec![],
        };
        assert_eq!(report.owner_of(5432).unwrap().service, "postgresql");
        assert_eq!(report.owner_of(8090).unwrap().status, AllocationStatus::Active);
        assert!(report.owner_of(1).is_none());
    }
}
