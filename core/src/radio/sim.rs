/// In-memory radio
///
/// Implements [`RadioAdapter`] over a fixed set of simulated peripherals.
/// Every request is recorded so callers can assert dispatch order. In
/// auto-respond mode each request is answered by pushing the matching
/// [`RadioEvent`] onto the event channel; in manual mode nothing is answered
/// and the caller injects events itself.
use super::{Advertisement, LinkState, OperationId, RadioAdapter, RadioEvent};
use crate::error::RadioError;
use crate::model::{CharacteristicRef, ManufacturerData, Service};
use crate::scan::ScanFilter;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Peripheral advertised and served by a [`SimulatedRadio`]
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub id: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub connectable: bool,
    pub manufacturer_data: ManufacturerData,
    services: Vec<Service>,
    values: HashMap<CharacteristicRef, Vec<u8>>,
}

impl SimulatedPeripheral {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: -60,
            connectable: true,
            manufacturer_data: ManufacturerData::new(),
            services: Vec::new(),
            values: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_value(mut self, service_id: &str, characteristic_id: &str, value: Vec<u8>) -> Self {
        self.values
            .insert(CharacteristicRef::new(service_id, characteristic_id), value);
        self
    }

    pub fn with_manufacturer_data(mut self, company_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.insert(company_id, data);
        self
    }

    pub fn non_connectable(mut self) -> Self {
        self.connectable = false;
        self
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn value(&self, target: &CharacteristicRef) -> Option<&[u8]> {
        self.values.get(target).map(Vec::as_slice)
    }

    fn has_characteristic(&self, target: &CharacteristicRef) -> bool {
        self.services
            .iter()
            .filter(|s| s.id == target.service_id)
            .any(|s| s.characteristic(&target.characteristic_id).is_some())
    }

    pub fn advertisement(&self) -> Advertisement {
        Advertisement {
            device_id: self.id.clone(),
            name: self.name.clone(),
            rssi: self.rssi,
            service_ids: self.services.iter().map(|s| s.id.clone()).collect(),
            manufacturer_data: self.manufacturer_data.clone(),
            is_connectable: self.connectable,
        }
    }
}

/// One call the core made into the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioRequest {
    StartScan(ScanFilter),
    StopScan,
    Connect(String),
    Disconnect(String),
    DiscoverServices {
        op: OperationId,
        device_id: String,
    },
    Read {
        op: OperationId,
        device_id: String,
        target: CharacteristicRef,
    },
    Write {
        op: OperationId,
        device_id: String,
        target: CharacteristicRef,
        data: Vec<u8>,
        with_response: bool,
    },
    Subscribe {
        op: OperationId,
        device_id: String,
        target: CharacteristicRef,
    },
    Unsubscribe {
        op: OperationId,
        device_id: String,
        target: CharacteristicRef,
    },
}

impl RadioRequest {
    pub fn op_id(&self) -> Option<OperationId> {
        match self {
            RadioRequest::DiscoverServices { op, .. }
            | RadioRequest::Read { op, .. }
            | RadioRequest::Write { op, .. }
            | RadioRequest::Subscribe { op, .. }
            | RadioRequest::Unsubscribe { op, .. } => Some(*op),
            _ => None,
        }
    }

    pub fn is_gatt(&self) -> bool {
        self.op_id().is_some()
    }
}

pub struct SimulatedRadio {
    enabled: AtomicBool,
    auto_respond: bool,
    peripherals: RwLock<Vec<SimulatedPeripheral>>,
    requests: Mutex<Vec<RadioRequest>>,
    reject_next: Mutex<Option<RadioError>>,
    events: mpsc::UnboundedSender<RadioEvent>,
}

impl SimulatedRadio {
    /// Records requests and answers nothing.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RadioEvent>) {
        Self::build(false)
    }

    /// Answers each request with the event a healthy peripheral would produce.
    pub fn auto_responding() -> (Self, mpsc::UnboundedReceiver<RadioEvent>) {
        Self::build(true)
    }

    fn build(auto_respond: bool) -> (Self, mpsc::UnboundedReceiver<RadioEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                enabled: AtomicBool::new(true),
                auto_respond,
                peripherals: RwLock::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
                reject_next: Mutex::new(None),
                events,
            },
            rx,
        )
    }

    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        let mut peripherals = self.peripherals.write();
        peripherals.retain(|p| p.id != peripheral.id);
        peripherals.push(peripheral);
    }

    pub fn peripheral(&self, device_id: &str) -> Option<SimulatedPeripheral> {
        self.peripherals
            .read()
            .iter()
            .find(|p| p.id == device_id)
            .cloned()
    }

    /// Power the simulated adapter on or off and report it.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        self.emit(RadioEvent::AdapterStateChanged { enabled });
    }

    /// Make the next request fail synchronously with `error`.
    pub fn reject_next(&self, error: RadioError) {
        *self.reject_next.lock() = Some(error);
    }

    pub fn requests(&self) -> Vec<RadioRequest> {
        self.requests.lock().clone()
    }

    pub fn take_requests(&self) -> Vec<RadioRequest> {
        std::mem::take(&mut *self.requests.lock())
    }

    /// Most recent GATT request, if any
    pub fn last_gatt_request(&self) -> Option<RadioRequest> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|r| r.is_gatt())
            .cloned()
    }

    pub fn emit(&self, event: RadioEvent) {
        if self.events.send(event).is_err() {
            debug!("Simulated radio event dropped: receiver closed");
        }
    }

    pub fn advertise_all(&self) {
        let adverts: Vec<Advertisement> = self
            .peripherals
            .read()
            .iter()
            .map(SimulatedPeripheral::advertisement)
            .collect();
        for adv in adverts {
            self.emit(RadioEvent::Advertisement(adv));
        }
    }

    pub fn notify(&self, device_id: &str, service_id: &str, characteristic_id: &str, data: Vec<u8>) {
        self.emit(RadioEvent::Notification {
            device_id: device_id.to_string(),
            service_id: service_id.to_string(),
            characteristic_id: characteristic_id.to_string(),
            data,
        });
    }

    /// Peer-initiated disconnect or link loss
    pub fn drop_link(&self, device_id: &str, reason: &str) {
        self.emit(RadioEvent::ConnectionStateChanged {
            device_id: device_id.to_string(),
            state: LinkState::Disconnected,
            reason: Some(reason.to_string()),
        });
    }

    fn record(&self, request: RadioRequest) -> Result<(), RadioError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(RadioError::Unavailable);
        }
        self.requests.lock().push(request.clone());
        if let Some(error) = self.reject_next.lock().take() {
            return Err(error);
        }
        if self.auto_respond {
            self.respond(request);
        }
        Ok(())
    }

    fn respond(&self, request: RadioRequest) {
        match request {
            RadioRequest::StartScan(_) => self.advertise_all(),
            RadioRequest::StopScan => {}
            RadioRequest::Connect(device_id) => {
                let event = match self.peripheral(&device_id) {
                    Some(p) if p.connectable => RadioEvent::ConnectionStateChanged {
                        device_id,
                        state: LinkState::Connected,
                        reason: None,
                    },
                    Some(_) => RadioEvent::ConnectionStateChanged {
                        device_id,
                        state: LinkState::Disconnected,
                        reason: Some("peripheral is not connectable".to_string()),
                    },
                    None => RadioEvent::ConnectionStateChanged {
                        device_id,
                        state: LinkState::Disconnected,
                        reason: Some("peripheral not in range".to_string()),
                    },
                };
                self.emit(event);
            }
            RadioRequest::Disconnect(device_id) => {
                self.emit(RadioEvent::ConnectionStateChanged {
                    device_id,
                    state: LinkState::Disconnected,
                    reason: None,
                });
            }
            RadioRequest::DiscoverServices { op, device_id } => {
                let result = self
                    .peripheral(&device_id)
                    .map(|p| p.services.clone())
                    .ok_or_else(|| "peripheral not in range".to_string());
                self.emit(RadioEvent::ServicesDiscovered {
                    device_id,
                    op,
                    result,
                });
            }
            RadioRequest::Read {
                op,
                device_id,
                target,
            } => {
                let result = match self.peripheral(&device_id) {
                    Some(p) if p.has_characteristic(&target) => {
                        Ok(Some(p.value(&target).map(<[u8]>::to_vec).unwrap_or_default()))
                    }
                    _ => Err("GATT_INVALID_HANDLE".to_string()),
                };
                self.emit(RadioEvent::OperationCompleted {
                    device_id,
                    op,
                    result,
                });
            }
            RadioRequest::Write {
                op,
                device_id,
                target,
                data,
                with_response,
            } => {
                {
                    let mut peripherals = self.peripherals.write();
                    if let Some(p) = peripherals.iter_mut().find(|p| p.id == device_id) {
                        p.values.insert(target, data);
                    }
                }
                let event = if with_response {
                    RadioEvent::OperationCompleted {
                        device_id,
                        op,
                        result: Ok(None),
                    }
                } else {
                    RadioEvent::WriteAccepted { device_id, op }
                };
                self.emit(event);
            }
            RadioRequest::Subscribe { op, device_id, .. }
            | RadioRequest::Unsubscribe { op, device_id, .. } => {
                self.emit(RadioEvent::OperationCompleted {
                    device_id,
                    op,
                    result: Ok(None),
                });
            }
        }
    }
}

#[async_trait]
impl RadioAdapter for SimulatedRadio {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn request_enable(&self) -> Result<(), RadioError> {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            self.emit(RadioEvent::AdapterStateChanged { enabled: true });
        }
        Ok(())
    }

    fn start_scan(&self, filter: &ScanFilter) -> Result<(), RadioError> {
        self.record(RadioRequest::StartScan(filter.clone()))
    }

    fn stop_scan(&self) -> Result<(), RadioError> {
        self.record(RadioRequest::StopScan)
    }

    fn connect(&self, device_id: &str) -> Result<(), RadioError> {
        self.record(RadioRequest::Connect(device_id.to_string()))
    }

    fn disconnect(&self, device_id: &str) -> Result<(), RadioError> {
        self.record(RadioRequest::Disconnect(device_id.to_string()))
    }

    fn discover_services(&self, op: OperationId, device_id: &str) -> Result<(), RadioError> {
        self.record(RadioRequest::DiscoverServices {
            op,
            device_id: device_id.to_string(),
        })
    }

    fn read(
        &self,
        op: OperationId,
        device_id: &str,
        target: &CharacteristicRef,
    ) -> Result<(), RadioError> {
        self.record(RadioRequest::Read {
            op,
            device_id: device_id.to_string(),
            target: target.clone(),
        })
    }

    fn write(
        &self,
        op: OperationId,
        device_id: &str,
        target: &CharacteristicRef,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), RadioError> {
        self.record(RadioRequest::Write {
            op,
            device_id: device_id.to_string(),
            target: target.clone(),
            data: data.to_vec(),
            with_response,
        })
    }

    fn subscribe(
        &self,
        op: OperationId,
        device_id: &str,
        target: &CharacteristicRef,
    ) -> Result<(), RadioError> {
        self.record(RadioRequest::Subscribe {
            op,
            device_id: device_id.to_string(),
            target: target.clone(),
        })
    }

    fn unsubscribe(
        &self,
        op: OperationId,
        device_id: &str,
        target: &CharacteristicRef,
    ) -> Result<(), RadioError> {
        self.record(RadioRequest::Unsubscribe {
            op,
            device_id: device_id.to_string(),
            target: target.clone(),
        })
    }
}
