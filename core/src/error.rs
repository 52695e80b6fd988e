//! Error taxonomy shared by every component of the GATT client core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// CORE ERRORS
// ============================================================================

/// Errors reported to the immediate caller of a failing operation.
///
/// `Clone` because a single event (link loss, adapter power-off) fans the same
/// failure out to every waiter queued on a connection.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattError {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("A scan session is already active")]
    AlreadyScanning,
    #[error("No scan session is active")]
    NotScanning,
    #[error("Device already connected: {0}")]
    AlreadyConnected(String),
    #[error("Device not connected: {0}")]
    NotConnected(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Service discovery already in progress")]
    DiscoveryInProgress,
    #[error("Unknown service: {0}")]
    UnknownService(String),
    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(String),
    #[error("Operation timed out")]
    OperationTimeout,
    #[error("Connection lost")]
    ConnectionLost,
    #[error("Bluetooth radio unavailable")]
    RadioUnavailable,
    #[error("Rejected by radio: {0}")]
    Rejected(String),
    #[error("Operation queue full")]
    QueueFull,
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
}

// ============================================================================
// RADIO ERRORS
// ============================================================================

/// Synchronous rejection returned by a [`crate::radio::RadioAdapter`] request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Bluetooth radio unavailable")]
    Unavailable,
    #[error("Radio rejected request: {0}")]
    Rejected(String),
}

impl From<RadioError> for GattError {
    fn from(err: RadioError) -> Self {
        match err {
            RadioError::Unavailable => GattError::RadioUnavailable,
            RadioError::Rejected(reason) => GattError::Rejected(reason),
        }
    }
}

// ============================================================================
// BINDING STATUS
// ============================================================================

/// Flat `(success, message)` status the application binding layer reports
/// back to its callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub success: bool,
    pub message: String,
}

impl OperationStatus {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    pub fn failed(error: &GattError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
        }
    }
}

impl<T> From<&Result<T, GattError>> for OperationStatus {
    fn from(result: &Result<T, GattError>) -> Self {
        match result {
            Ok(_) => OperationStatus::ok(),
            Err(e) => OperationStatus::failed(e),
        }
    }
}
