// Integration test: connection lifecycle and GATT operation ordering
//
// The simulated radio runs in manual mode: it records every request and
// answers nothing, so each test injects the radio's events itself and can
// check exactly what was dispatched, and when.

use blenexus_core::{
    Characteristic, CharacteristicProperties, ConnectionState, GattClientCore, GattConfig,
    GattError, LinkState, RadioEvent, RadioRequest, Service, SimulatedPeripheral, SimulatedRadio,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const HRM: &str = "C4:7C:8D:6A:12:01";
const HR_SERVICE: &str = "180D";
const HR_MEASUREMENT: &str = "2A37";
const BODY_LOCATION: &str = "2A38";
const CONTROL_POINT: &str = "2A39";

fn heart_rate_services() -> Vec<Service> {
    vec![Service::new(
        HR_SERVICE,
        vec![
            Characteristic::new(
                HR_MEASUREMENT,
                CharacteristicProperties {
                    readable: true,
                    notifiable: true,
                    ..Default::default()
                },
            ),
            Characteristic::new(BODY_LOCATION, CharacteristicProperties::read_only()),
            Characteristic::new(
                CONTROL_POINT,
                CharacteristicProperties {
                    writable: true,
                    writable_without_response: true,
                    ..Default::default()
                },
            ),
        ],
    )]
}

fn setup_with(config: GattConfig) -> (GattClientCore, Arc<SimulatedRadio>, mpsc::UnboundedReceiver<RadioEvent>) {
    let (radio, events) = SimulatedRadio::new();
    let radio = Arc::new(radio);
    radio.add_peripheral(SimulatedPeripheral::new(HRM).with_name("HRM"));
    let core = GattClientCore::new(radio.clone(), config).expect("core");
    (core, radio, events)
}

fn setup() -> (GattClientCore, Arc<SimulatedRadio>, mpsc::UnboundedReceiver<RadioEvent>) {
    setup_with(GattConfig::default())
}

fn link(core: &GattClientCore, state: LinkState, reason: Option<&str>) {
    core.handle_radio_event(RadioEvent::ConnectionStateChanged {
        device_id: HRM.to_string(),
        state,
        reason: reason.map(str::to_string),
    });
}

fn last_op(radio: &SimulatedRadio) -> u64 {
    radio
        .last_gatt_request()
        .and_then(|r| r.op_id())
        .expect("a GATT request was dispatched")
}

fn gatt_requests(radio: &SimulatedRadio) -> Vec<RadioRequest> {
    radio.requests().into_iter().filter(|r| r.is_gatt()).collect()
}

fn complete(core: &GattClientCore, op: u64, value: Option<Vec<u8>>) {
    core.handle_radio_event(RadioEvent::OperationCompleted {
        device_id: HRM.to_string(),
        op,
        result: Ok(value),
    });
}

async fn connect_and_discover(core: &GattClientCore, radio: &SimulatedRadio) {
    let connect = core.connect(HRM);
    link(core, LinkState::Connected, None);
    connect.await.expect("connect");

    let discover = core.discover_services(HRM, None);
    core.handle_radio_event(RadioEvent::ServicesDiscovered {
        device_id: HRM.to_string(),
        op: last_op(radio),
        result: Ok(heart_rate_services()),
    });
    discover.await.expect("discover");
}

#[tokio::test]
async fn test_full_session_lifecycle() {
    let (core, radio, _events) = setup();
    let mut states = core.subscribe_connection_events();

    connect_and_discover(&core, &radio).await;
    assert_eq!(core.connection_state(HRM), ConnectionState::Connected);
    assert_eq!(
        core.get_characteristics(HRM, HR_SERVICE)
            .expect("characteristics")
            .len(),
        3
    );

    let read = core.read_characteristic(HRM, HR_SERVICE, BODY_LOCATION, None);
    complete(&core, last_op(&radio), Some(vec![0x01]));
    assert_eq!(read.await, Ok(vec![0x01]));

    let write = core.write_characteristic(HRM, HR_SERVICE, CONTROL_POINT, vec![0x01], true, None);
    complete(&core, last_op(&radio), None);
    assert!(write.await.is_ok());

    let subscribe = core.subscribe_to_characteristic(HRM, HR_SERVICE, HR_MEASUREMENT, None);
    complete(&core, last_op(&radio), None);
    let mut notifications = subscribe.await.expect("subscribed");

    core.handle_radio_event(RadioEvent::Notification {
        device_id: HRM.to_string(),
        service_id: "0000180D-0000-1000-8000-00805F9B34FB".to_string(),
        characteristic_id: "2A37".to_string(),
        data: vec![0x06, 0x48],
    });
    let n = notifications.recv().await.expect("notification");
    assert_eq!(n.value, vec![0x06, 0x48]);

    let disconnect = core.disconnect(HRM);
    assert_eq!(radio.requests().last(), Some(&RadioRequest::Disconnect(HRM.to_string())));
    link(&core, LinkState::Disconnected, None);
    disconnect.await.expect("disconnect");

    assert!(!core.is_connected(HRM));
    assert!(notifications.recv().await.is_none());

    let observed: Vec<ConnectionState> = std::iter::from_fn(|| states.try_recv().ok())
        .map(|e| e.state)
        .collect();
    assert_eq!(
        observed,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::DiscoveringServices,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ]
    );
}

#[tokio::test]
async fn test_fifo_dispatch_order_and_single_in_flight() {
    let (core, radio, _events) = setup();
    connect_and_discover(&core, &radio).await;
    radio.take_requests();

    let n = 8;
    let futures: Vec<_> = (0..n)
        .map(|i| {
            core.write_characteristic(HRM, HR_SERVICE, CONTROL_POINT, vec![i as u8], true, None)
        })
        .collect();

    for i in 0..n {
        // exactly one new dispatch per completion
        let dispatched = gatt_requests(&radio);
        assert_eq!(dispatched.len(), i + 1, "one in flight at a time");
        match &dispatched[i] {
            RadioRequest::Write { data, .. } => assert_eq!(data, &vec![i as u8]),
            other => panic!("unexpected request {:?}", other),
        }
        complete(&core, last_op(&radio), None);
    }

    for fut in futures {
        assert!(fut.await.is_ok());
    }
}

#[tokio::test]
async fn test_disconnect_fails_every_queued_operation() {
    let (core, radio, _events) = setup();
    connect_and_discover(&core, &radio).await;
    radio.take_requests();

    let k = 5;
    let reads: Vec<_> = (0..k)
        .map(|_| core.read_characteristic(HRM, HR_SERVICE, BODY_LOCATION, None))
        .collect();
    let in_flight_op = last_op(&radio);

    let disconnect = core.disconnect(HRM);

    let mut lost = 0;
    for read in reads {
        match read.await {
            Err(GattError::ConnectionLost) => lost += 1,
            other => panic!("expected ConnectionLost, got {:?}", other),
        }
    }
    assert_eq!(lost, k);

    // a late completion for the flushed read changes nothing
    complete(&core, in_flight_op, Some(vec![0xFF]));
    link(&core, LinkState::Disconnected, None);
    disconnect.await.expect("disconnect");

    assert_eq!(gatt_requests(&radio).len(), 1, "only the head was ever dispatched");
}

#[tokio::test]
async fn test_unsolicited_link_loss() {
    let (core, radio, _events) = setup();
    connect_and_discover(&core, &radio).await;

    let subscribe = core.subscribe_to_characteristic(HRM, HR_SERVICE, HR_MEASUREMENT, None);
    complete(&core, last_op(&radio), None);
    let mut notifications = subscribe.await.expect("subscribed");

    let read = core.read_characteristic(HRM, HR_SERVICE, HR_MEASUREMENT, None);
    let queued = core.read_characteristic(HRM, HR_SERVICE, BODY_LOCATION, None);

    link(&core, LinkState::Disconnected, Some("supervision timeout"));

    assert_eq!(read.await, Err(GattError::ConnectionLost));
    assert_eq!(queued.await, Err(GattError::ConnectionLost));
    assert!(notifications.recv().await.is_none());
    assert_eq!(core.connection_state(HRM), ConnectionState::Disconnected);
    assert_eq!(
        core.get_services(HRM),
        Err(GattError::NotConnected(HRM.to_string()))
    );

    // a fresh connection starts from scratch
    let reconnect = core.connect(HRM);
    link(&core, LinkState::Connected, None);
    reconnect.await.expect("reconnect");
    assert!(core.get_services(HRM).expect("connected").is_empty());
}

#[tokio::test]
async fn test_connect_failure_scenario() {
    let (core, _radio, _events) = setup();

    let connect = core.connect("X");
    assert_eq!(core.connection_state("X"), ConnectionState::Connecting);

    core.handle_radio_event(RadioEvent::ConnectionStateChanged {
        device_id: "X".to_string(),
        state: LinkState::Disconnected,
        reason: Some("GATT_ERROR (133)".to_string()),
    });

    assert_eq!(
        connect.await,
        Err(GattError::ConnectionFailed("GATT_ERROR (133)".to_string()))
    );
    assert_eq!(core.connection_state("X"), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_write_without_response_then_read_keeps_order() {
    let (core, radio, _events) = setup();
    connect_and_discover(&core, &radio).await;
    radio.take_requests();

    let write = core.write_characteristic(HRM, HR_SERVICE, CONTROL_POINT, vec![0x02], false, None);
    let read = core.read_characteristic(HRM, HR_SERVICE, BODY_LOCATION, None);

    let dispatched = radio.requests();
    assert_eq!(dispatched.len(), 1);
    assert!(matches!(
        dispatched[0],
        RadioRequest::Write {
            with_response: false,
            ..
        }
    ));

    core.handle_radio_event(RadioEvent::WriteAccepted {
        device_id: HRM.to_string(),
        op: last_op(&radio),
    });
    assert!(write.await.is_ok());
    assert!(matches!(
        radio.requests().last(),
        Some(RadioRequest::Read { .. })
    ));

    complete(&core, last_op(&radio), Some(vec![0x03]));
    assert_eq!(read.await, Ok(vec![0x03]));
}

#[tokio::test]
async fn test_unknown_characteristic_even_when_connected() {
    let (core, radio, _events) = setup();
    connect_and_discover(&core, &radio).await;
    radio.take_requests();

    assert!(matches!(
        core.read_characteristic(HRM, HR_SERVICE, "2A3F", None).await,
        Err(GattError::UnknownCharacteristic(_))
    ));
    assert!(matches!(
        core.write_characteristic(HRM, "1809", "2A1C", vec![], true, None)
            .await,
        Err(GattError::UnknownCharacteristic(_))
    ));
    assert!(radio.requests().is_empty());
}

#[tokio::test]
async fn test_operations_before_discovery_are_unknown() {
    let (core, _radio, _events) = setup();
    let connect = core.connect(HRM);
    link(&core, LinkState::Connected, None);
    connect.await.expect("connect");

    assert!(matches!(
        core.read_characteristic(HRM, HR_SERVICE, BODY_LOCATION, None)
            .await,
        Err(GattError::UnknownCharacteristic(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_operation_timeout_keeps_link() {
    let config = GattConfig {
        operation_timeout_ms: 200,
        ..Default::default()
    };
    let (core, radio, _events) = setup_with(config);
    connect_and_discover(&core, &radio).await;

    let slow = core.read_characteristic(HRM, HR_SERVICE, BODY_LOCATION, None);
    let slow_op = last_op(&radio);
    let next = core.read_characteristic(HRM, HR_SERVICE, HR_MEASUREMENT, Some(Duration::from_secs(5)));

    assert_eq!(slow.await, Err(GattError::OperationTimeout));
    assert!(core.is_connected(HRM));

    let next_op = last_op(&radio);
    assert_ne!(slow_op, next_op);

    // the radio finally answers the timed-out read: dropped as stale
    complete(&core, slow_op, Some(vec![0xAA]));
    complete(&core, next_op, Some(vec![0xBB]));
    assert_eq!(next.await, Ok(vec![0xBB]));
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_cancels_attempt() {
    let config = GattConfig {
        connect_timeout_ms: 2_000,
        ..Default::default()
    };
    let (core, radio, _events) = setup_with(config);

    let result = core.connect(HRM).await;
    assert_eq!(
        result,
        Err(GattError::ConnectionFailed(
            "connection attempt timed out".to_string()
        ))
    );
    assert_eq!(
        radio.requests(),
        vec![
            RadioRequest::Connect(HRM.to_string()),
            RadioRequest::Disconnect(HRM.to_string()),
        ]
    );
    assert!(!core.is_connected(HRM));
}

#[tokio::test]
async fn test_status_shape_for_bindings() {
    let (core, _radio, _events) = setup();

    let status = core.disconnect(HRM).status().await;
    assert!(!status.success);
    assert!(status.message.contains(HRM));
}
