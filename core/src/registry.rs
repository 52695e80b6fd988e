//! Device Registry — every peripheral the core knows about
//!
//! Devices enter on a scan sighting or by explicit registration (including the
//! implicit registration a connect-by-id performs). They leave when the scan
//! session that found them ends without them ever having been connected, or
//! when explicitly forgotten. Discovered GATT tables are cached per device
//! while a connection is alive.

use crate::error::GattError;
use crate::ids::normalize_uuid;
use crate::model::{Characteristic, CharacteristicRef, Device, Service};
use crate::radio::Advertisement;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct DeviceRecord {
    device: Device,
    /// Survives scan-end eviction once true
    ever_connected: bool,
    /// Explicitly registered by the caller
    pinned: bool,
    /// Populated only by a completed discovery
    services: Option<Vec<Service>>,
}

impl DeviceRecord {
    fn new(device: Device) -> Self {
        Self {
            device,
            ever_connected: false,
            pinned: false,
            services: None,
        }
    }
}

/// Registry-wide map: many readers, single writer
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.read().contains_key(device_id)
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.read().get(device_id).map(|r| r.device.clone())
    }

    /// Snapshot of all known devices, ordered by id
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .read()
            .values()
            .map(|r| r.device.clone())
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Explicit registration. The device is kept across scan sessions.
    pub fn register(&self, device_id: &str) -> Device {
        let mut devices = self.devices.write();
        let record = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRecord::new(Device::unseen(device_id)));
        record.pinned = true;
        debug!("Device registered: {}", device_id);
        record.device.clone()
    }

    /// Create or refresh a device from an advertisement.
    pub fn upsert_advertisement(&self, adv: &Advertisement) -> Device {
        let mut devices = self.devices.write();
        let record = devices
            .entry(adv.device_id.clone())
            .or_insert_with(|| DeviceRecord::new(Device::unseen(adv.device_id.clone())));

        let device = &mut record.device;
        device.name = adv.name.clone();
        device.rssi = Some(adv.rssi);
        device.service_ids = adv.service_ids.iter().map(|s| normalize_uuid(s)).collect();
        device.manufacturer_data = adv.manufacturer_data.clone();
        device.is_connectable = adv.is_connectable;

        device.clone()
    }

    pub fn is_connectable(&self, device_id: &str) -> Option<bool> {
        self.devices
            .read()
            .get(device_id)
            .map(|r| r.device.is_connectable)
    }

    /// Recreates the record if an eviction raced the connect.
    pub fn mark_connected(&self, device_id: &str) {
        let mut devices = self.devices.write();
        let record = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRecord::new(Device::unseen(device_id)));
        record.ever_connected = true;
    }

    // ========================================================================
    // GATT CACHE
    // ========================================================================

    pub fn set_services(&self, device_id: &str, services: Vec<Service>) {
        if let Some(record) = self.devices.write().get_mut(device_id) {
            debug!("Cached {} services for {}", services.len(), device_id);
            record.services = Some(services);
        }
    }

    pub fn clear_services(&self, device_id: &str) {
        if let Some(record) = self.devices.write().get_mut(device_id) {
            record.services = None;
        }
    }

    /// `None` until discovery has completed on the current connection
    pub fn services(&self, device_id: &str) -> Option<Vec<Service>> {
        self.devices
            .read()
            .get(device_id)
            .and_then(|r| r.services.clone())
    }

    pub fn characteristics(
        &self,
        device_id: &str,
        service_id: &str,
    ) -> Result<Vec<Characteristic>, GattError> {
        let wanted = normalize_uuid(service_id);
        let devices = self.devices.read();
        devices
            .get(device_id)
            .and_then(|r| r.services.as_ref())
            .and_then(|services| services.iter().find(|s| s.id == wanted))
            .map(|s| s.characteristics.clone())
            .ok_or(GattError::UnknownService(wanted))
    }

    /// Look up a characteristic exactly as discovery returned it.
    pub fn characteristic(
        &self,
        device_id: &str,
        target: &CharacteristicRef,
    ) -> Option<Characteristic> {
        let devices = self.devices.read();
        devices
            .get(device_id)?
            .services
            .as_ref()?
            .iter()
            .find(|s| s.id == target.service_id)?
            .characteristics
            .iter()
            .find(|c| c.id == target.characteristic_id)
            .cloned()
    }

    // ========================================================================
    // EVICTION
    // ========================================================================

    /// Drop devices from `candidates` that were never connected or pinned,
    /// unless `keep` says otherwise. Returns how many were removed.
    ///
    /// `keep` runs with no registry lock held; callers pass closures that
    /// take the connection map.
    pub fn evict_unconnected<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a String>,
        keep: impl Fn(&str) -> bool,
    ) -> usize {
        let evictable: Vec<&String> = {
            let devices = self.devices.read();
            candidates
                .into_iter()
                .filter(|id| {
                    devices
                        .get(id.as_str())
                        .map(|r| !r.ever_connected && !r.pinned)
                        .unwrap_or(false)
                })
                .collect()
        };
        let evictable: Vec<&String> = evictable
            .into_iter()
            .filter(|id| !keep(id.as_str()))
            .collect();
        if evictable.is_empty() {
            return 0;
        }

        let mut devices = self.devices.write();
        let mut removed = 0;
        for id in evictable {
            // re-checked: the device may have connected since the read
            let still_evictable = devices
                .get(id.as_str())
                .map(|r| !r.ever_connected && !r.pinned)
                .unwrap_or(false);
            if still_evictable {
                devices.remove(id.as_str());
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Evicted {} unconnected devices", removed);
        }
        removed
    }

    /// Explicitly forget one device. Devices `keep` protects (live
    /// connections) cannot be forgotten.
    pub fn forget(&self, device_id: &str, keep: impl Fn(&str) -> bool) -> Result<(), GattError> {
        if !self.contains(device_id) {
            return Err(GattError::UnknownDevice(device_id.to_string()));
        }
        if keep(device_id) {
            return Err(GattError::AlreadyConnected(device_id.to_string()));
        }
        self.devices
            .write()
            .remove(device_id)
            .map(|_| ())
            .ok_or_else(|| GattError::UnknownDevice(device_id.to_string()))
    }

    /// Forget every device `keep` does not protect. Returns how many were removed.
    pub fn clear(&self, keep: impl Fn(&str) -> bool) -> usize {
        let ids: Vec<String> = self.devices.read().keys().cloned().collect();
        let doomed: Vec<String> = ids.into_iter().filter(|id| !keep(id.as_str())).collect();

        let mut devices = self.devices.write();
        doomed
            .iter()
            .filter(|id| devices.remove(id.as_str()).is_some())
            .count()
    }
}
