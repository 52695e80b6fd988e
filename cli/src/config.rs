// Configuration management for the blenexus CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blenexus/config.json
// - Linux: ~/.config/blenexus/config.json
// - Windows: %APPDATA%\blenexus\config.json

use anyhow::{Context, Result};
use blenexus_core::GattConfig;
use std::path::{Path, PathBuf};

/// Keys accepted by `config set`, in display order
pub const KEYS: &[&str] = &[
    "operation_timeout_ms",
    "connect_timeout_ms",
    "disconnect_timeout_ms",
    "max_queue_depth",
    "default_rssi_threshold",
];

/// Get the config file path (cross-platform)
pub fn default_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("blenexus");
    Ok(config_dir.join("config.json"))
}

/// Load config from `path`, falling back to defaults when it does not exist
pub fn load(path: &Path) -> Result<GattConfig> {
    GattConfig::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

pub fn save(config: &GattConfig, path: &Path) -> Result<()> {
    config
        .save(path)
        .with_context(|| format!("Failed to write config to {}", path.display()))
}

/// Set a config value. The result is validated before it is returned.
pub fn set(config: &mut GattConfig, key: &str, value: &str) -> Result<()> {
    let mut updated = config.clone();
    match key {
        "operation_timeout_ms" => {
            updated.operation_timeout_ms = value.parse().context("Invalid number")?;
        }
        "connect_timeout_ms" => {
            updated.connect_timeout_ms = value.parse().context("Invalid number")?;
        }
        "disconnect_timeout_ms" => {
            updated.disconnect_timeout_ms = value.parse().context("Invalid number")?;
        }
        "max_queue_depth" => {
            updated.max_queue_depth = value.parse().context("Invalid number")?;
        }
        "default_rssi_threshold" => {
            updated.default_rssi_threshold = value.parse().context("Invalid dBm value")?;
        }
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
    updated
        .validate()
        .with_context(|| format!("Rejected {} = {}", key, value))?;
    *config = updated;
    Ok(())
}

pub fn get(config: &GattConfig, key: &str) -> Option<String> {
    match key {
        "operation_timeout_ms" => Some(config.operation_timeout_ms.to_string()),
        "connect_timeout_ms" => Some(config.connect_timeout_ms.to_string()),
        "disconnect_timeout_ms" => Some(config.disconnect_timeout_ms.to_string()),
        "max_queue_depth" => Some(config.max_queue_depth.to_string()),
        "default_rssi_threshold" => Some(config.default_rssi_threshold.to_string()),
        _ => None,
    }
}

/// List all config values
pub fn list(config: &GattConfig) -> Vec<(&'static str, String)> {
    KEYS.iter()
        .filter_map(|key| get(config, key).map(|value| (*key, value)))
        .collect()
}
