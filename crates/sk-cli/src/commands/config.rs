//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success};
use sk_core::config::{self, NodeConfig};

fn config_file(config_path: Option<&Path>) -> PathBuf {
    config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(config::default_config_path)
}

fn effective_config(path: &Path) -> Result<NodeConfig> {
    if !path.exists() {
        return Ok(NodeConfig::default());
    }
    NodeConfig::load(Some(path)).with_context(|| format!("Failed to load config from {:?}", path))
}

/// Show the effective configuration: the file if there is one, with
/// defaults for everything it leaves out
pub fn config_show(config_path: Option<&Path>) -> Result<()> {
    let path = config_file(config_path);
    let effective = effective_config(&path)?;

    if path.exists() {
        print_info(&format!("Configuration file: {:?}", path));
    } else {
        print_info("No configuration file; showing defaults");
    }
    println!();
    println!("{}", toml::to_string_pretty(&effective)?);

    Ok(())
}

/// Get one value of the effective configuration by dotted key
pub fn config_get(config_path: Option<&Path>, key: &str) -> Result<bool> {
    let effective = effective_config(&config_file(config_path))?;
    let root = toml::Value::try_from(&effective)?;

    let mut current = &root;
    for part in key.split('.') {
        match current.as_table().and_then(|t| t.get(part)) {
            Some(v) => current = v,
            None => {
                print_error(&format!("Key not found: {}", key));
                return Ok(false);
            }
        }
    }

    match current {
        toml::Value::String(s) => println!("{}", s),
        toml::Value::Table(_) => println!("{}", toml::to_string_pretty(current)?),
        other => println!("{}", other),
    }
    Ok(true)
}

/// Write the default configuration
pub fn config_init(config_path: Option<&Path>, force: bool) -> Result<bool> {
    let path = config_file(config_path);

    if path.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(false);
    }

    config::save_config(&path, &NodeConfig::default())
        .with_context(|| format!("Failed to write config file: {:?}", path))?;
    print_success(&format!("Created configuration file: {:?}", path));
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        assert!(config_init(Some(&path), false).unwrap());
        let loaded = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, NodeConfig::default());

        // Refuses to clobber without --force
        assert!(!config_init(Some(&path), false).unwrap());
        assert!(config_init(Some(&path), true).unwrap());
    }

    #[test]
    fn test_get_nested_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[discovery]\nbeacon_port = 9191\n").unwrap();

        assert!(config_get(Some(&path), "discovery.beacon_port").unwrap());
        assert!(!config_get(Some(&path), "discovery.nope").unwrap());
    }
}
