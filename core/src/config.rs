//! Runtime tunables for the GATT client core
//!
//! - Per-operation, connect and disconnect timeouts
//! - Per-connection queue depth (backpressure)
//! - Default RSSI floor applied by `ScanFilter::default()`

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Fallback timeout for a single queued GATT operation.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 64;
/// Permissive floor: anything the radio can hear is reported.
pub const DEFAULT_RSSI_THRESHOLD: i16 = -100;

const MIN_RSSI: i16 = -127;
const MAX_RSSI: i16 = 20;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid {0}: must be > 0")]
    InvalidTimeout(&'static str),

    #[error("Invalid queue depth: must be > 0")]
    InvalidQueueDepth,

    #[error("Invalid RSSI threshold: must be -127..=20 dBm, got {0}")]
    InvalidRssiThreshold(i16),

    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// GATT CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GattConfig {
    /// Deadline for one discover/read/write/subscribe once it is dispatched
    pub operation_timeout_ms: u64,

    /// Deadline for a connect attempt to reach the Connected state
    pub connect_timeout_ms: u64,

    /// After this long a disconnect resolves locally even if the radio is silent
    pub disconnect_timeout_ms: u64,

    /// Maximum queued operations per connection, in-flight included
    pub max_queue_depth: usize,

    /// RSSI floor used when a scan filter does not specify one
    pub default_rssi_threshold: i16,
}

impl GattConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("operation_timeout_ms"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("connect_timeout_ms"));
        }
        if self.disconnect_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("disconnect_timeout_ms"));
        }
        if self.max_queue_depth == 0 {
            return Err(ConfigError::InvalidQueueDepth);
        }
        if !(MIN_RSSI..=MAX_RSSI).contains(&self.default_rssi_threshold) {
            return Err(ConfigError::InvalidRssiThreshold(
                self.default_rssi_threshold,
            ));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// Load a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: GattConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            default_rssi_threshold: DEFAULT_RSSI_THRESHOLD,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
