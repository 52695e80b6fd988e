// Nexus BLE — GATT client core
//
// Scan lifecycle, connection lifecycle, discovery caching and ordered GATT
// operations against one physical radio. Everything OS-specific sits behind
// `RadioAdapter`.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handle;
pub mod ids;
pub mod model;
pub mod queue;
pub mod radio;
pub mod registry;
pub mod scan;

pub use client::GattClientCore;
pub use config::{ConfigError, GattConfig};
pub use connection::ConnectionManager;
pub use error::{GattError, OperationStatus, RadioError};
pub use handle::{GattFuture, NotificationStream};
pub use ids::normalize_uuid;
pub use model::{
    Characteristic, CharacteristicProperties, CharacteristicRef, ConnectionEvent,
    ConnectionState, Device, ManufacturerData, ManufacturerDataEntry, Notification, Service,
};
pub use queue::{OperationKind, OperationOutput, OperationQueue, PendingOperation};
pub use radio::{
    Advertisement, LinkState, OperationId, RadioAdapter, RadioEvent, RadioRequest,
    SimulatedPeripheral, SimulatedRadio,
};
pub use registry::DeviceRegistry;
pub use scan::{ScanFilter, ScanHandle, ScanSession};

/// Install the default fmt subscriber (`RUST_LOG`, else `info`).
///
/// Idempotent; a subscriber installed by the host application wins.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
