//! Radio Adapter seam
//!
//! The core never talks to an OS Bluetooth stack directly. Everything physical
//! goes through a [`RadioAdapter`] injected at construction; everything the
//! radio reports comes back as a [`RadioEvent`].
//!
//! Request methods only dispatch. An `Err` return is a synchronous rejection;
//! success means the outcome will arrive later as an event carrying the same
//! [`OperationId`].

pub mod sim;

use crate::error::RadioError;
use crate::model::{CharacteristicRef, ManufacturerData, Service};
use crate::scan::ScanFilter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use sim::{RadioRequest, SimulatedPeripheral, SimulatedRadio};

/// Identifies one dispatched GATT request; echoed back in its completion.
pub type OperationId = u64;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Ask the OS to power the radio on (may prompt the user).
    async fn request_enable(&self) -> Result<(), RadioError>;

    fn start_scan(&self, filter: &ScanFilter) -> Result<(), RadioError>;

    fn stop_scan(&self) -> Result<(), RadioError>;

    fn connect(&self, device_id: &str) -> Result<(), RadioError>;

    fn disconnect(&self, device_id: &str) -> Result<(), RadioError>;

    fn discover_services(&self, op: OperationId, device_id: &str) -> Result<(), RadioError>;

    fn read(
        &self,
        op: OperationId,
        device_id: &str,
        target: &CharacteristicRef,
    ) -> Result<(), RadioError>;

    fn write(
        &self,
        op: OperationId,
        device_id: &str,
        target: &CharacteristicRef,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), RadioError>;

    /// Enable notifications (writes the CCCD on the peripheral).
    fn subscribe(
        &self,
        op: OperationId,
        device_id: &str,
        target: &CharacteristicRef,
    ) -> Result<(), RadioError>;

    fn unsubscribe(
        &self,
        op: OperationId,
        device_id: &str,
        target: &CharacteristicRef,
    ) -> Result<(), RadioError>;
}

/// Link-layer state reported by the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// One advertisement as heard by the radio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub device_id: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub service_ids: Vec<String>,
    pub manufacturer_data: ManufacturerData,
    pub is_connectable: bool,
}

impl Advertisement {
    pub fn new(device_id: impl Into<String>, rssi: i16) -> Self {
        Self {
            device_id: device_id.into(),
            name: None,
            rssi,
            service_ids: Vec::new(),
            manufacturer_data: ManufacturerData::new(),
            is_connectable: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_service(mut self, service_id: impl Into<String>) -> Self {
        self.service_ids.push(service_id.into());
        self
    }

    pub fn with_manufacturer_data(mut self, company_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.insert(company_id, data);
        self
    }

    pub fn non_connectable(mut self) -> Self {
        self.is_connectable = false;
        self
    }

    /// Same advertised content, ignoring signal strength.
    pub fn same_payload(&self, other: &Advertisement) -> bool {
        self.device_id == other.device_id
            && self.name == other.name
            && self.service_ids == other.service_ids
            && self.manufacturer_data == other.manufacturer_data
            && self.is_connectable == other.is_connectable
    }
}

/// Everything the radio reports back to the core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioEvent {
    Advertisement(Advertisement),
    ConnectionStateChanged {
        device_id: String,
        state: LinkState,
        reason: Option<String>,
    },
    ServicesDiscovered {
        device_id: String,
        op: OperationId,
        result: Result<Vec<Service>, String>,
    },
    /// Completion of a read, write-with-response, subscribe or unsubscribe.
    /// `Err` carries the radio's reason (e.g. a GATT status code).
    OperationCompleted {
        device_id: String,
        op: OperationId,
        result: Result<Option<Vec<u8>>, String>,
    },
    /// Local buffer accepted a write-without-response
    WriteAccepted { device_id: String, op: OperationId },
    Notification {
        device_id: String,
        service_id: String,
        characteristic_id: String,
        data: Vec<u8>,
    },
    AdapterStateChanged { enabled: bool },
}

impl RadioEvent {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            RadioEvent::Advertisement(adv) => Some(&adv.device_id),
            RadioEvent::ConnectionStateChanged { device_id, .. }
            | RadioEvent::ServicesDiscovered { device_id, .. }
            | RadioEvent::OperationCompleted { device_id, .. }
            | RadioEvent::WriteAccepted { device_id, .. }
            | RadioEvent::Notification { device_id, .. } => Some(device_id),
            RadioEvent::AdapterStateChanged { .. } => None,
        }
    }
}
