//! Scan Session — scan lifecycle and advertisement filtering
//!
//! At most one session is active. Each advertisement is filtered (RSSI floor,
//! then service allow-list), folded into the registry, then emitted unless it
//! duplicates what this session already reported for the device.

use crate::config::DEFAULT_RSSI_THRESHOLD;
use crate::error::GattError;
use crate::ids::normalize_uuid;
use crate::model::Device;
use crate::radio::{Advertisement, RadioAdapter};
use crate::registry::DeviceRegistry;
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ============================================================================
// SCAN FILTER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Service allow-list (normalised); empty accepts any device
    pub service_ids: Vec<String>,
    /// Advertisements weaker than this (dBm) are dropped
    pub rssi_threshold: i16,
    /// Re-emit unchanged advertisements from an already reported device
    pub allow_duplicates: bool,
}

impl ScanFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service_id: &str) -> Self {
        self.service_ids.push(normalize_uuid(service_id));
        self
    }

    pub fn with_services<'a>(mut self, service_ids: impl IntoIterator<Item = &'a str>) -> Self {
        self.service_ids
            .extend(service_ids.into_iter().map(normalize_uuid));
        self
    }

    pub fn with_rssi_threshold(mut self, rssi_threshold: i16) -> Self {
        self.rssi_threshold = rssi_threshold;
        self
    }

    pub fn allow_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    pub fn passes_rssi(&self, rssi: i16) -> bool {
        rssi >= self.rssi_threshold
    }

    pub fn passes_services(&self, adv: &Advertisement) -> bool {
        if self.service_ids.is_empty() {
            return true;
        }
        adv.service_ids.iter().any(|advertised| {
            let advertised = normalize_uuid(advertised);
            self.service_ids
                .iter()
                .any(|wanted| normalize_uuid(wanted) == advertised)
        })
    }
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self {
            service_ids: Vec::new(),
            rssi_threshold: DEFAULT_RSSI_THRESHOLD,
            allow_duplicates: false,
        }
    }
}

// ============================================================================
// SCAN HANDLE
// ============================================================================

/// Stream of devices discovered by one scan session; ends when it stops.
#[derive(Debug)]
pub struct ScanHandle {
    rx: mpsc::UnboundedReceiver<Device>,
}

impl ScanHandle {
    pub async fn recv(&mut self) -> Option<Device> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Device> {
        self.rx.try_recv().ok()
    }
}

impl Stream for ScanHandle {
    type Item = Device;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Device>> {
        self.rx.poll_recv(cx)
    }
}

// ============================================================================
// SCAN SESSION
// ============================================================================

struct ActiveScan {
    filter: ScanFilter,
    /// Last advertisement emitted per device (duplicate suppression)
    reported: HashMap<String, Advertisement>,
    /// Devices that passed the filter this session (eviction candidates)
    seen: HashSet<String>,
    tx: mpsc::UnboundedSender<Device>,
}

pub struct ScanSession {
    radio: Arc<dyn RadioAdapter>,
    registry: Arc<DeviceRegistry>,
    active: Mutex<Option<ActiveScan>>,
}

impl ScanSession {
    pub fn new(radio: Arc<dyn RadioAdapter>, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            radio,
            registry,
            active: Mutex::new(None),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn start_scan(&self, filter: ScanFilter) -> Result<ScanHandle, GattError> {
        if !self.radio.is_enabled() {
            return Err(GattError::RadioUnavailable);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut active = self.active.lock();
            if active.is_some() {
                return Err(GattError::AlreadyScanning);
            }
            *active = Some(ActiveScan {
                filter: filter.clone(),
                reported: HashMap::new(),
                seen: HashSet::new(),
                tx,
            });
        }

        if let Err(e) = self.radio.start_scan(&filter) {
            warn!("Radio refused to start scan: {}", e);
            self.active.lock().take();
            return Err(e.into());
        }

        info!(
            "Scan started (services: {:?}, rssi >= {} dBm, duplicates: {})",
            filter.service_ids, filter.rssi_threshold, filter.allow_duplicates
        );
        Ok(ScanHandle { rx })
    }

    /// End the session and evict devices it found that `keep` does not protect
    /// and that were never connected.
    pub fn stop_scan(&self, keep: impl Fn(&str) -> bool) -> Result<(), GattError> {
        let scan = self.active.lock().take().ok_or(GattError::NotScanning)?;
        let radio_result = self.radio.stop_scan();

        let evicted = self.registry.evict_unconnected(&scan.seen, keep);
        info!(
            "Scan stopped ({} devices seen, {} evicted)",
            scan.seen.len(),
            evicted
        );

        radio_result.map_err(GattError::from)
    }

    /// End the session without asking the radio (the radio already stopped).
    pub fn abort(&self, keep: impl Fn(&str) -> bool) -> bool {
        match self.active.lock().take() {
            Some(scan) => {
                self.registry.evict_unconnected(&scan.seen, keep);
                warn!("Scan session aborted");
                true
            }
            None => false,
        }
    }

    /// Apply the active filter to one advertisement. Returns the device if it
    /// was emitted to the session's stream.
    pub fn handle_advertisement(&self, adv: Advertisement) -> Option<Device> {
        let mut active = self.active.lock();
        let scan = match active.as_mut() {
            Some(scan) => scan,
            None => {
                debug!("Advertisement from {} outside a scan session", adv.device_id);
                return None;
            }
        };

        if !scan.filter.passes_rssi(adv.rssi) {
            debug!(
                "Suppressed {} (rssi {} < {})",
                adv.device_id, adv.rssi, scan.filter.rssi_threshold
            );
            return None;
        }
        if !scan.filter.passes_services(&adv) {
            return None;
        }

        let device = self.registry.upsert_advertisement(&adv);
        scan.seen.insert(adv.device_id.clone());

        if !scan.filter.allow_duplicates {
            if let Some(previous) = scan.reported.get(&adv.device_id) {
                if previous.same_payload(&adv) {
                    return None;
                }
            }
        }
        scan.reported.insert(adv.device_id.clone(), adv);

        if scan.tx.send(device.clone()).is_err() {
            debug!("Scan handle dropped; discovery of {} not delivered", device.id);
        }
        Some(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RadioError;
    use crate::radio::MockRadioAdapter;

    fn enabled_radio() -> MockRadioAdapter {
        let mut radio = MockRadioAdapter::new();
        radio.expect_is_enabled().return_const(true);
        radio
    }

    fn session(radio: MockRadioAdapter) -> (ScanSession, Arc<DeviceRegistry>) {
        let registry = Arc::new(DeviceRegistry::new());
        (
            ScanSession::new(Arc::new(radio), registry.clone()),
            registry,
        )
    }

    #[test]
    fn test_scan_filter_defaults() {
        let filter = ScanFilter::new();
        assert!(filter.service_ids.is_empty());
        assert_eq!(filter.rssi_threshold, -100);
        assert!(!filter.allow_duplicates);
    }

    #[test]
    fn test_scan_double_start_error() {
        let mut radio = enabled_radio();
        radio.expect_start_scan().times(1).returning(|_| Ok(()));
        let (scan, _) = session(radio);

        let mut handle = scan.start_scan(ScanFilter::new()).expect("first start");
        scan.handle_advertisement(Advertisement::new("AA", -50));

        assert_eq!(
            scan.start_scan(ScanFilter::new()).err(),
            Some(GattError::AlreadyScanning)
        );

        // duplicate suppression state survived the rejected restart
        assert!(scan
            .handle_advertisement(Advertisement::new("AA", -50))
            .is_none());
        assert_eq!(handle.try_recv().map(|d| d.id), Some("AA".to_string()));
        assert!(handle.try_recv().is_none());
    }

    #[test]
    fn test_scan_double_stop_error() {
        let mut radio = enabled_radio();
        radio.expect_start_scan().returning(|_| Ok(()));
        radio.expect_stop_scan().times(1).returning(|| Ok(()));
        let (scan, _) = session(radio);

        scan.start_scan(ScanFilter::new()).expect("start");
        assert!(scan.stop_scan(|_| false).is_ok());
        assert_eq!(scan.stop_scan(|_| false), Err(GattError::NotScanning));
        assert!(!scan.is_scanning());
    }

    #[test]
    fn test_scan_radio_unavailable() {
        let mut radio = MockRadioAdapter::new();
        radio.expect_is_enabled().return_const(false);
        radio.expect_start_scan().times(0);
        let (scan, _) = session(radio);

        assert_eq!(
            scan.start_scan(ScanFilter::new()).err(),
            Some(GattError::RadioUnavailable)
        );
        assert!(!scan.is_scanning());
    }

    #[test]
    fn test_scan_radio_rejects_start() {
        let mut radio = enabled_radio();
        radio
            .expect_start_scan()
            .returning(|_| Err(RadioError::Rejected("scan throttled".to_string())));
        let (scan, _) = session(radio);

        assert_eq!(
            scan.start_scan(ScanFilter::new()).err(),
            Some(GattError::Rejected("scan throttled".to_string()))
        );
        assert!(!scan.is_scanning());
    }

    #[test]
    fn test_rssi_threshold_suppression() {
        let mut radio = enabled_radio();
        radio.expect_start_scan().returning(|_| Ok(()));
        let (scan, registry) = session(radio);

        let mut handle = scan
            .start_scan(ScanFilter::new().with_rssi_threshold(-80))
            .expect("start");

        assert!(scan
            .handle_advertisement(Advertisement::new("X", -90))
            .is_none());
        assert!(!registry.contains("X"));

        assert!(scan
            .handle_advertisement(Advertisement::new("X", -70))
            .is_some());
        assert_eq!(handle.try_recv().and_then(|d| d.rssi), Some(-70));
    }

    #[test]
    fn test_duplicate_suppression_reemits_changed_payload() {
        let mut radio = enabled_radio();
        radio.expect_start_scan().returning(|_| Ok(()));
        let (scan, _) = session(radio);
        scan.start_scan(ScanFilter::new()).expect("start");

        let adv = Advertisement::new("AA", -60).with_manufacturer_data(0x004C, vec![1]);
        assert!(scan.handle_advertisement(adv.clone()).is_some());

        // rssi change alone is not new data
        let mut weaker = adv.clone();
        weaker.rssi = -65;
        assert!(scan.handle_advertisement(weaker).is_none());

        let changed = Advertisement::new("AA", -60).with_manufacturer_data(0x004C, vec![2]);
        assert!(scan.handle_advertisement(changed).is_some());
    }

    #[test]
    fn test_allow_duplicates() {
        let mut radio = enabled_radio();
        radio.expect_start_scan().returning(|_| Ok(()));
        let (scan, _) = session(radio);
        scan.start_scan(ScanFilter::new().allow_duplicates(true))
            .expect("start");

        let adv = Advertisement::new("AA", -60);
        assert!(scan.handle_advertisement(adv.clone()).is_some());
        assert!(scan.handle_advertisement(adv).is_some());
    }

    #[test]
    fn test_service_allow_list() {
        let mut radio = enabled_radio();
        radio.expect_start_scan().returning(|_| Ok(()));
        let (scan, registry) = session(radio);
        scan.start_scan(ScanFilter::new().with_service("180D"))
            .expect("start");

        assert!(scan
            .handle_advertisement(Advertisement::new("A", -40).with_service("180F"))
            .is_none());
        assert!(scan
            .handle_advertisement(
                Advertisement::new("B", -40)
                    .with_service("0000180D-0000-1000-8000-00805F9B34FB")
            )
            .is_some());
        assert!(!registry.contains("A"));
        assert!(registry.contains("B"));
    }

    #[test]
    fn test_stop_evicts_unconnected_devices() {
        let mut radio = enabled_radio();
        radio.expect_start_scan().returning(|_| Ok(()));
        radio.expect_stop_scan().returning(|| Ok(()));
        let (scan, registry) = session(radio);

        let mut handle = scan.start_scan(ScanFilter::new()).expect("start");
        scan.handle_advertisement(Advertisement::new("A", -40));
        scan.handle_advertisement(Advertisement::new("B", -40));
        scan.handle_advertisement(Advertisement::new("C", -40));
        registry.mark_connected("A");

        scan.stop_scan(|id| id == "B").expect("stop");

        assert!(registry.contains("A"));
        assert!(registry.contains("B"));
        assert!(!registry.contains("C"));

        // stream ends with the session
        while handle.try_recv().is_some() {}
        assert!(matches!(
            handle.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_emission_order_matches_arrival() {
        let mut radio = enabled_radio();
        radio.expect_start_scan().returning(|_| Ok(()));
        let (scan, _) = session(radio);
        let mut handle = scan.start_scan(ScanFilter::new()).expect("start");

        let ids = ["D", "B", "A", "C"];
        for id in ids {
            scan.handle_advertisement(Advertisement::new(id, -50));
        }

        let received: Vec<String> = std::iter::from_fn(|| handle.try_recv())
            .map(|d| d.id)
            .collect();
        assert_eq!(received, ids);
    }
}
