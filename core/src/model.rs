//! Data model shared between the registry, the connection manager and callers.

use crate::ids::normalize_uuid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// MANUFACTURER DATA
// ============================================================================

/// One company-id/payload pair in list form, as binding layers marshal it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerDataEntry {
    pub id: u16,
    pub data: Vec<u8>,
}

/// Company identifier -> raw advertisement payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerData(BTreeMap<u16, Vec<u8>>);

impl ManufacturerData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, company_id: u16, data: Vec<u8>) {
        self.0.insert(company_id, data);
    }

    pub fn get(&self, company_id: u16) -> Option<&[u8]> {
        self.0.get(&company_id).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &[u8])> {
        self.0.iter().map(|(id, data)| (*id, data.as_slice()))
    }

    /// Entries ordered by company id
    pub fn to_entries(&self) -> Vec<ManufacturerDataEntry> {
        self.0
            .iter()
            .map(|(id, data)| ManufacturerDataEntry {
                id: *id,
                data: data.clone(),
            })
            .collect()
    }

    /// Later entries win when a company id repeats.
    pub fn from_entries(entries: impl IntoIterator<Item = ManufacturerDataEntry>) -> Self {
        Self(entries.into_iter().map(|e| (e.id, e.data)).collect())
    }
}

// ============================================================================
// DEVICE
// ============================================================================

/// A peripheral known to the registry, from a scan sighting or by explicit id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Opaque, radio-assigned identifier (stable per OS session)
    pub id: String,
    pub name: Option<String>,
    /// Last-seen signal strength in dBm; `None` until first advertised
    pub rssi: Option<i16>,
    /// Service identifiers from the latest advertisement (normalised)
    pub service_ids: BTreeSet<String>,
    pub manufacturer_data: ManufacturerData,
    pub is_connectable: bool,
}

impl Device {
    /// Placeholder for a device registered by id without a sighting.
    pub fn unseen(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: None,
            service_ids: BTreeSet::new(),
            manufacturer_data: ManufacturerData::new(),
            is_connectable: true,
        }
    }

    pub fn advertises_service(&self, service_id: &str) -> bool {
        self.service_ids.contains(&normalize_uuid(service_id))
    }
}

// ============================================================================
// GATT TABLE
// ============================================================================

/// Properties reported by the radio for a characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub readable: bool,
    pub writable: bool,
    pub writable_without_response: bool,
    pub notifiable: bool,
}

impl CharacteristicProperties {
    pub fn read_only() -> Self {
        Self {
            readable: true,
            ..Default::default()
        }
    }

    pub fn all() -> Self {
        Self {
            readable: true,
            writable: true,
            writable_without_response: true,
            notifiable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub id: String,
    pub properties: CharacteristicProperties,
}

impl Characteristic {
    pub fn new(id: &str, properties: CharacteristicProperties) -> Self {
        Self {
            id: normalize_uuid(id),
            properties,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(id: &str, characteristics: Vec<Characteristic>) -> Self {
        Self {
            id: normalize_uuid(id),
            characteristics,
        }
    }

    pub fn characteristic(&self, characteristic_id: &str) -> Option<&Characteristic> {
        let wanted = normalize_uuid(characteristic_id);
        self.characteristics.iter().find(|c| c.id == wanted)
    }
}

/// (service, characteristic) pair addressing one characteristic on a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacteristicRef {
    pub service_id: String,
    pub characteristic_id: String,
}

impl CharacteristicRef {
    pub fn new(service_id: &str, characteristic_id: &str) -> Self {
        Self {
            service_id: normalize_uuid(service_id),
            characteristic_id: normalize_uuid(characteristic_id),
        }
    }
}

impl std::fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service_id, self.characteristic_id)
    }
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Per-device connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Sub-state of Connected; gates GATT operations until discovery finishes
    DiscoveringServices,
    Disconnecting,
}

impl ConnectionState {
    /// Link is up (GATT traffic possible)
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::DiscoveringServices)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Emitted on every connection state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub device_id: String,
    pub state: ConnectionState,
    pub reason: Option<String>,
}

/// Value pushed by a peripheral for a subscribed characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub device_id: String,
    pub service_id: String,
    pub characteristic_id: String,
    pub value: Vec<u8>,
}
