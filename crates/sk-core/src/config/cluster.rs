//! Cluster link configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration;

/// Settings for cluster links and their listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Address to bind the link listener to
    pub bind_address: String,

    /// Link listener port (0 picks an ephemeral port)
    pub port: u16,

    /// Heartbeat interval; a link degrades after twice this much silence
    #[serde(with = "duration")]
    pub heartbeat_interval: Duration,

    /// How long to wait for the peer's registration
    #[serde(with = "duration")]
    pub handshake_timeout: Duration,

    /// How long to wait for a TCP connect
    #[serde(with = "duration")]
    pub connect_timeout: Duration,

    /// Graceful shutdown deadline
    #[serde(with = "duration")]
    pub shutdown_timeout: Duration,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            heartbeat_interval: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(2),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Silence after which an established link is degraded
    pub fn degrade_after(&self) -> Duration {
        self.heartbeat_interval * 2
    }

    /// Listener bind address as `host:port`
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
