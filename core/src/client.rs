//! GattClientCore — the single entry point for the application binding layer
//!
//! Owns the radio handle and hands it to the scan session and the connection
//! manager at construction. Radio callbacks come back in through
//! [`GattClientCore::handle_radio_event`] (from any thread) or a channel
//! drained by [`GattClientCore::drive`].

use crate::config::GattConfig;
use crate::connection::ConnectionManager;
use crate::error::GattError;
use crate::handle::{GattFuture, NotificationStream};
use crate::model::{
    Characteristic, CharacteristicRef, ConnectionEvent, ConnectionState, Device, Service,
};
use crate::radio::{RadioAdapter, RadioEvent};
use crate::registry::DeviceRegistry;
use crate::scan::{ScanFilter, ScanHandle, ScanSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cheap to clone; every clone drives the same radio and state.
#[derive(Clone)]
pub struct GattClientCore {
    config: Arc<GattConfig>,
    radio: Arc<dyn RadioAdapter>,
    registry: Arc<DeviceRegistry>,
    scanner: Arc<ScanSession>,
    connections: Arc<ConnectionManager>,
    runtime: Handle,
}

impl GattClientCore {
    /// Build a core on the current Tokio runtime.
    pub fn new(radio: Arc<dyn RadioAdapter>, config: GattConfig) -> Result<Self, GattError> {
        let runtime = Handle::try_current().map_err(|e| GattError::Runtime(e.to_string()))?;
        Self::with_runtime(radio, config, runtime)
    }

    pub fn with_runtime(
        radio: Arc<dyn RadioAdapter>,
        config: GattConfig,
        runtime: Handle,
    ) -> Result<Self, GattError> {
        crate::init_logging();
        config
            .validate()
            .map_err(|e| GattError::InvalidConfig(e.to_string()))?;

        let registry = Arc::new(DeviceRegistry::new());
        let scanner = Arc::new(ScanSession::new(radio.clone(), registry.clone()));
        let connections = Arc::new(ConnectionManager::new(
            radio.clone(),
            registry.clone(),
            config.clone(),
            runtime.clone(),
        ));

        info!("GATT client core initialized");
        Ok(Self {
            config: Arc::new(config),
            radio,
            registry,
            scanner,
            connections,
            runtime,
        })
    }

    pub fn config(&self) -> &GattConfig {
        &self.config
    }

    /// Filter with this core's configured RSSI floor
    pub fn default_scan_filter(&self) -> ScanFilter {
        ScanFilter::new().with_rssi_threshold(self.config.default_rssi_threshold)
    }

    // ========================================================================
    // ADAPTER
    // ========================================================================

    pub fn is_bluetooth_enabled(&self) -> bool {
        self.radio.is_enabled()
    }

    pub async fn request_bluetooth_enable(&self) -> Result<(), GattError> {
        self.radio.request_enable().await.map_err(GattError::from)
    }

    // ========================================================================
    // SCANNING
    // ========================================================================

    pub fn start_scan(&self, filter: ScanFilter) -> Result<ScanHandle, GattError> {
        self.scanner.start_scan(filter)
    }

    /// Devices with a live connection record survive the scan-end eviction.
    pub fn stop_scan(&self) -> Result<(), GattError> {
        let connections = self.connections.clone();
        self.scanner
            .stop_scan(move |id| connections.has_connection(id))
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    // ========================================================================
    // CONNECTIONS
    // ========================================================================

    /// Connect-by-id is always permitted: an unseen id is registered first.
    pub fn connect(&self, device_id: &str) -> GattFuture<()> {
        if !self.radio.is_enabled() {
            return GattFuture::failed(GattError::RadioUnavailable);
        }
        if device_id.is_empty() {
            return GattFuture::failed(GattError::UnknownDevice(String::new()));
        }
        if self.registry.is_connectable(device_id) == Some(false) {
            return GattFuture::failed(GattError::ConnectionFailed(
                "device advertises as non-connectable".to_string(),
            ));
        }
        if !self.registry.contains(device_id) {
            debug!("Registering {} on connect", device_id);
            self.registry.register(device_id);
        }
        self.connections.connect(device_id)
    }

    pub fn disconnect(&self, device_id: &str) -> GattFuture<()> {
        self.connections.disconnect(device_id)
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.connections.is_connected(device_id)
    }

    pub fn connection_state(&self, device_id: &str) -> ConnectionState {
        self.connections.state(device_id)
    }

    pub fn connected_devices(&self) -> Vec<String> {
        self.connections.connected_devices()
    }

    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connections.subscribe_events()
    }

    // ========================================================================
    // GATT
    // ========================================================================

    pub fn discover_services(
        &self,
        device_id: &str,
        timeout: Option<Duration>,
    ) -> GattFuture<Vec<Service>> {
        self.connections.discover_services(device_id, timeout)
    }

    /// Cached GATT table; empty until discovery has run on this connection.
    pub fn get_services(&self, device_id: &str) -> Result<Vec<Service>, GattError> {
        if !self.connections.is_connected(device_id) {
            return Err(GattError::NotConnected(device_id.to_string()));
        }
        Ok(self.registry.services(device_id).unwrap_or_default())
    }

    pub fn get_characteristics(
        &self,
        device_id: &str,
        service_id: &str,
    ) -> Result<Vec<Characteristic>, GattError> {
        if !self.connections.is_connected(device_id) {
            return Err(GattError::NotConnected(device_id.to_string()));
        }
        self.registry.characteristics(device_id, service_id)
    }

    pub fn read_characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        timeout: Option<Duration>,
    ) -> GattFuture<Vec<u8>> {
        self.connections.read(
            device_id,
            CharacteristicRef::new(service_id, characteristic_id),
            timeout,
        )
    }

    pub fn write_characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        data: Vec<u8>,
        with_response: bool,
        timeout: Option<Duration>,
    ) -> GattFuture<()> {
        self.connections.write(
            device_id,
            CharacteristicRef::new(service_id, characteristic_id),
            data,
            with_response,
            timeout,
        )
    }

    pub fn subscribe_to_characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        timeout: Option<Duration>,
    ) -> GattFuture<NotificationStream> {
        self.connections.subscribe(
            device_id,
            CharacteristicRef::new(service_id, characteristic_id),
            timeout,
        )
    }

    pub fn unsubscribe_from_characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        timeout: Option<Duration>,
    ) -> GattFuture<()> {
        self.connections.unsubscribe(
            device_id,
            CharacteristicRef::new(service_id, characteristic_id),
            timeout,
        )
    }

    // ========================================================================
    // DEVICE REGISTRY
    // ========================================================================

    pub fn devices(&self) -> Vec<Device> {
        self.registry.devices()
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.registry.get(device_id)
    }

    pub fn register_device(&self, device_id: &str) -> Device {
        self.registry.register(device_id)
    }

    /// Fails with `AlreadyConnected` while a connection record exists.
    pub fn forget_device(&self, device_id: &str) -> Result<(), GattError> {
        let connections = &self.connections;
        self.registry
            .forget(device_id, |id| connections.has_connection(id))
    }

    /// Forget every device without a connection record.
    pub fn clear_devices(&self) -> usize {
        let connections = &self.connections;
        self.registry.clear(|id| connections.has_connection(id))
    }

    // ========================================================================
    // RADIO EVENTS
    // ========================================================================

    pub fn handle_radio_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::Advertisement(adv) => {
                self.scanner.handle_advertisement(adv);
            }
            RadioEvent::ConnectionStateChanged {
                device_id,
                state,
                reason,
            } => self.connections.handle_link_event(&device_id, state, reason),
            RadioEvent::ServicesDiscovered {
                device_id,
                op,
                result,
            } => self
                .connections
                .handle_services_discovered(&device_id, op, result),
            RadioEvent::OperationCompleted {
                device_id,
                op,
                result,
            } => self
                .connections
                .handle_operation_completed(&device_id, op, result),
            RadioEvent::WriteAccepted { device_id, op } => {
                self.connections.handle_write_accepted(&device_id, op)
            }
            RadioEvent::Notification {
                device_id,
                service_id,
                characteristic_id,
                data,
            } => self.connections.handle_notification(
                &device_id,
                &service_id,
                &characteristic_id,
                data,
            ),
            RadioEvent::AdapterStateChanged { enabled: true } => {
                info!("Bluetooth adapter enabled");
            }
            RadioEvent::AdapterStateChanged { enabled: false } => {
                warn!("Bluetooth adapter disabled; dropping scan and connections");
                self.connections.handle_adapter_disabled();
                let connections = &self.connections;
                self.scanner.abort(|id| connections.has_connection(id));
            }
        }
    }

    /// Feed every event from `events` into the core until the sender closes.
    pub fn drive(&self, mut events: mpsc::UnboundedReceiver<RadioEvent>) -> JoinHandle<()> {
        let core = self.clone();
        self.runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                core.handle_radio_event(event);
            }
            debug!("Radio event channel closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::error::RadioError;
    use crate::model::CharacteristicProperties;
    use crate::radio::{Advertisement, LinkState, MockRadioAdapter};

    fn core(radio: MockRadioAdapter) -> GattClientCore {
        GattClientCore::new(Arc::new(radio), GattConfig::default()).expect("core")
    }

    fn enabled_radio() -> MockRadioAdapter {
        let mut radio = MockRadioAdapter::new();
        radio.expect_is_enabled().return_const(true);
        radio
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = GattClientCore::new(Arc::new(MockRadioAdapter::new()), GattConfig::default());
        assert!(matches!(result, Err(GattError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = GattConfig {
            max_queue_depth: 0,
            ..Default::default()
        };
        let result = GattClientCore::new(Arc::new(MockRadioAdapter::new()), config);
        assert_eq!(
            result.err(),
            Some(GattError::InvalidConfig(
                ConfigError::InvalidQueueDepth.to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_radio_unavailable_short_circuits() {
        let mut radio = MockRadioAdapter::new();
        radio.expect_is_enabled().return_const(false);
        radio.expect_start_scan().times(0);
        radio.expect_connect().times(0);
        radio.expect_read().times(0);
        radio.expect_write().times(0);
        let core = core(radio);

        assert_eq!(
            core.start_scan(ScanFilter::new()).err(),
            Some(GattError::RadioUnavailable)
        );
        assert_eq!(core.connect("AA").await, Err(GattError::RadioUnavailable));
        assert_eq!(
            core.read_characteristic("AA", "180D", "2A37", None).await,
            Err(GattError::RadioUnavailable)
        );
        assert_eq!(
            core.write_characteristic("AA", "180D", "2A37", vec![1], true, None)
                .await,
            Err(GattError::RadioUnavailable)
        );
        // nothing was registered on the way
        assert!(core.devices().is_empty());
        assert!(!core.is_scanning());
    }

    #[tokio::test]
    async fn test_connect_by_id_registers_device() {
        let mut radio = enabled_radio();
        radio.expect_connect().times(1).returning(|_| Ok(()));
        let core = core(radio);

        let fut = core.connect("11:22:33");
        assert!(core.device("11:22:33").is_some());
        assert_eq!(core.connection_state("11:22:33"), ConnectionState::Connecting);

        core.handle_radio_event(RadioEvent::ConnectionStateChanged {
            device_id: "11:22:33".to_string(),
            state: LinkState::Connected,
            reason: None,
        });
        fut.await.expect("connected");
        assert!(core.is_connected("11:22:33"));
        assert_eq!(core.connected_devices(), vec!["11:22:33".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_non_connectable_refused() {
        let mut radio = enabled_radio();
        radio.expect_start_scan().returning(|_| Ok(()));
        radio.expect_connect().times(0);
        let core = core(radio);

        let _scan = core.start_scan(ScanFilter::new()).expect("scan");
        core.handle_radio_event(RadioEvent::Advertisement(
            Advertisement::new("BEACON", -40).non_connectable(),
        ));

        assert!(matches!(
            core.connect("BEACON").await,
            Err(GattError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_get_services_requires_connection() {
        let core = core(enabled_radio());
        assert_eq!(
            core.get_services("AA"),
            Err(GattError::NotConnected("AA".to_string()))
        );
        assert_eq!(
            core.get_characteristics("AA", "180D"),
            Err(GattError::NotConnected("AA".to_string()))
        );
    }

    #[tokio::test]
    async fn test_discovery_populates_cache() {
        let mut radio = enabled_radio();
        radio.expect_connect().returning(|_| Ok(()));
        radio.expect_discover_services().returning(|_, _| Ok(()));
        let core = core(radio);

        let connect = core.connect("AA");
        core.handle_radio_event(RadioEvent::ConnectionStateChanged {
            device_id: "AA".into(),
            state: LinkState::Connected,
            reason: None,
        });
        connect.await.expect("connect");
        assert!(core.get_services("AA").expect("connected").is_empty());

        let discover = core.discover_services("AA", None);
        let (op, _) = core.connections.in_flight("AA").expect("in flight");
        core.handle_radio_event(RadioEvent::ServicesDiscovered {
            device_id: "AA".into(),
            op,
            result: Ok(vec![Service::new(
                "180F",
                vec![Characteristic::new(
                    "2A19",
                    CharacteristicProperties::read_only(),
                )],
            )]),
        });
        discover.await.expect("discovered");

        assert_eq!(core.get_services("AA").expect("services").len(), 1);
        assert_eq!(
            core.get_characteristics("AA", "180f")
                .expect("characteristics")
                .len(),
            1
        );
        assert!(matches!(
            core.get_characteristics("AA", "1800"),
            Err(GattError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn test_forget_connected_device_refused() {
        let mut radio = enabled_radio();
        radio.expect_connect().returning(|_| Ok(()));
        let core = core(radio);

        let _connect = core.connect("AA");
        core.register_device("BB");

        assert_eq!(
            core.forget_device("AA"),
            Err(GattError::AlreadyConnected("AA".to_string()))
        );
        assert_eq!(core.clear_devices(), 1);
        assert!(core.device("AA").is_some());
    }

    #[tokio::test]
    async fn test_adapter_disabled_ends_scan() {
        let mut radio = enabled_radio();
        radio.expect_start_scan().returning(|_| Ok(()));
        radio.expect_stop_scan().times(0);
        let core = core(radio);

        let mut scan = core.start_scan(ScanFilter::new()).expect("scan");
        core.handle_radio_event(RadioEvent::AdapterStateChanged { enabled: false });

        assert!(!core.is_scanning());
        assert!(scan.recv().await.is_none());
        assert_eq!(core.stop_scan(), Err(GattError::NotScanning));
    }

    #[tokio::test]
    async fn test_request_enable_maps_error() {
        let mut radio = MockRadioAdapter::new();
        radio
            .expect_request_enable()
            .returning(|| Err(RadioError::Rejected("user declined".to_string())));
        let core = core(radio);

        assert_eq!(
            core.request_bluetooth_enable().await,
            Err(GattError::Rejected("user declined".to_string()))
        );
    }

    #[tokio::test]
    async fn test_default_scan_filter_uses_config() {
        let config = GattConfig {
            default_rssi_threshold: -75,
            ..Default::default()
        };
        let core = GattClientCore::new(Arc::new(MockRadioAdapter::new()), config).expect("core");
        assert_eq!(core.default_scan_filter().rssi_threshold, -75);
    }
}
