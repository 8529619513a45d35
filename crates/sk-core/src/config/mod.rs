//! Configuration management for skein

mod cluster;
mod discovery;
mod node;
mod ports;
pub mod serde_utils;

pub use cluster::{BackoffConfig, ClusterConfig};
pub use discovery::DiscoveryConfig;
pub use node::{NodeConfig, NodeSection};
pub use ports::{PortsConfig, ReservedPort, CLUSTER_SERVICE};

use crate::error::ConfigError;
use std::io;
use std::path::{Path, PathBuf};

/// Directory holding skein's config file, `<config_dir>/skein`
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("skein")
}

/// `<config_dir>/skein/config.toml`
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Parse a TOML file. A missing file is `ConfigError::NotFound`.
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_path_buf()))
        }
        Err(e) => {
            return Err(ConfigError::Invalid(format!(
                "Cannot read {}: {}",
                path.display(),
                e
            )))
        }
    };
    Ok(toml::from_str(&content)?)
}

/// Write a config as TOML, creating parent directories. The file is
/// written beside the target and renamed over it, so readers never see a
/// half-written config.
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    let io_err = |what: &str, e: io::Error| {
        ConfigError::Invalid(format!("Cannot {} {}: {}", what, path.display(), e))
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| io_err("create directory for", e))?;
    }

    let staging = path.with_extension("toml.tmp");
    std::fs::write(&staging, content).map_err(|e| io_err("write", e))?;
    std::fs::rename(&staging, path).map_err(|e| io_err("replace", e))?;
    Ok(())
}
