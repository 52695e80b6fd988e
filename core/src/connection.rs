//! Connection Manager — per-device connection state machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//!                               Connected -> DiscoveringServices -> Connected
//! ```
//!
//! One record per device, present only while the state is not Disconnected.
//! Each record owns the device's [`OperationQueue`]; this module pumps it,
//! one operation in flight at a time, and routes radio completions back.
//!
//! Locking: the connection map is taken before a connection record, and a
//! record before the registry. The registry never calls back into this
//! manager while holding its own lock. Nothing calls into the radio while
//! holding any of them.

use crate::config::GattConfig;
use crate::error::{GattError, RadioError};
use crate::handle::{GattFuture, NotificationStream};
use crate::ids::normalize_uuid;
use crate::model::{
    Characteristic, CharacteristicRef, ConnectionEvent, ConnectionState, Notification, Service,
};
use crate::queue::{
    OperationKind, OperationOutput, OperationQueue, OperationResult, PendingOperation,
};
use crate::radio::{LinkState, OperationId, RadioAdapter};
use crate::registry::DeviceRegistry;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

const REASON_CONNECT_TIMEOUT: &str = "connection attempt timed out";
const REASON_CONNECT_CANCELLED: &str = "connection cancelled by disconnect";
const REASON_LINK_LOST: &str = "link lost";
const REASON_ADAPTER_OFF: &str = "bluetooth adapter disabled";

type Waiter = oneshot::Sender<OperationResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPhase {
    Connect,
    Disconnect,
}

/// Live connection record
struct Connection {
    device_id: String,
    state: ConnectionState,
    /// Distinguishes this record from earlier ones for the same device so
    /// stale timers never touch a newer connection
    generation: u64,
    queue: OperationQueue,
    /// Every live stream per characteristic; a repeat subscribe adds one
    subscriptions: HashMap<CharacteristicRef, Vec<mpsc::UnboundedSender<Notification>>>,
    connect_waiter: Option<Waiter>,
    disconnect_waiters: Vec<Waiter>,
    op_timer: Option<AbortHandle>,
    link_timer: Option<AbortHandle>,
}

impl Connection {
    fn new(device_id: &str, generation: u64, max_queue_depth: usize, waiter: Waiter) -> Self {
        Self {
            device_id: device_id.to_string(),
            state: ConnectionState::Connecting,
            generation,
            queue: OperationQueue::new(max_queue_depth),
            subscriptions: HashMap::new(),
            connect_waiter: Some(waiter),
            disconnect_waiters: Vec::new(),
            op_timer: None,
            link_timer: None,
        }
    }

    fn abort_timers(&mut self) {
        if let Some(timer) = self.op_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.link_timer.take() {
            timer.abort();
        }
    }
}

/// Snapshot of the in-flight operation taken under the lock, sent without it
struct Dispatch {
    op: OperationId,
    kind: OperationKind,
    device_id: String,
    target: Option<CharacteristicRef>,
    payload: Vec<u8>,
}

pub struct ConnectionManager {
    radio: Arc<dyn RadioAdapter>,
    registry: Arc<DeviceRegistry>,
    config: GattConfig,
    runtime: Handle,
    connections: RwLock<HashMap<String, Arc<Mutex<Connection>>>>,
    events: broadcast::Sender<ConnectionEvent>,
    next_op: AtomicU64,
    next_generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        radio: Arc<dyn RadioAdapter>,
        registry: Arc<DeviceRegistry>,
        config: GattConfig,
        runtime: Handle,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            radio,
            registry,
            config,
            runtime,
            connections: RwLock::new(HashMap::new()),
            events,
            next_op: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    fn get(&self, device_id: &str) -> Option<Arc<Mutex<Connection>>> {
        self.connections.read().get(device_id).cloned()
    }

    pub fn state(&self, device_id: &str) -> ConnectionState {
        self.get(device_id)
            .map(|conn| conn.lock().state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Link up: `Connected` or `DiscoveringServices`
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.state(device_id).is_connected()
    }

    /// A record exists (any state other than Disconnected)
    pub fn has_connection(&self, device_id: &str) -> bool {
        self.connections.read().contains_key(device_id)
    }

    pub fn connected_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .read()
            .iter()
            .filter(|(_, conn)| conn.lock().state.is_connected())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Operations queued on a device, in-flight included
    pub fn queue_len(&self, device_id: &str) -> usize {
        self.get(device_id)
            .map(|conn| conn.lock().queue.len())
            .unwrap_or(0)
    }

    pub fn in_flight(&self, device_id: &str) -> Option<(OperationId, OperationKind)> {
        let conn = self.get(device_id)?;
        let conn = conn.lock();
        conn.queue.in_flight().map(|op| (op.id, op.kind))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, device_id: &str, state: ConnectionState, reason: Option<String>) {
        // No subscribers is fine.
        let _ = self.events.send(ConnectionEvent {
            device_id: device_id.to_string(),
            state,
            reason,
        });
    }

    // ========================================================================
    // CONNECT / DISCONNECT
    // ========================================================================

    pub fn connect(self: &Arc<Self>, device_id: &str) -> GattFuture<()> {
        if !self.radio.is_enabled() {
            return GattFuture::failed(GattError::RadioUnavailable);
        }
        if !self.registry.contains(device_id) {
            return GattFuture::failed(GattError::UnknownDevice(device_id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut connections = self.connections.write();
            if connections.contains_key(device_id) {
                return GattFuture::failed(GattError::AlreadyConnected(device_id.to_string()));
            }
            connections.insert(
                device_id.to_string(),
                Arc::new(Mutex::new(Connection::new(
                    device_id,
                    generation,
                    self.config.max_queue_depth,
                    tx,
                ))),
            );
        }
        self.emit(device_id, ConnectionState::Connecting, None);
        info!("Connecting to {}", device_id);

        if let Err(e) = self.radio.connect(device_id) {
            warn!("Radio refused connect to {}: {}", device_id, e);
            let error = match e {
                RadioError::Unavailable => GattError::RadioUnavailable,
                RadioError::Rejected(reason) => GattError::ConnectionFailed(reason),
            };
            self.remove_record(device_id, generation);
            self.emit(
                device_id,
                ConnectionState::Disconnected,
                Some(error.to_string()),
            );
            return GattFuture::failed(error);
        }

        self.arm_link_timer(device_id, generation, LinkPhase::Connect);
        GattFuture::pending(rx, |_| Ok(()))
    }

    pub fn disconnect(self: &Arc<Self>, device_id: &str) -> GattFuture<()> {
        let conn = match self.get(device_id) {
            Some(conn) => conn,
            None => return GattFuture::failed(GattError::NotConnected(device_id.to_string())),
        };

        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut c = conn.lock();
            if c.state == ConnectionState::Disconnected {
                return GattFuture::failed(GattError::NotConnected(device_id.to_string()));
            }
            c.disconnect_waiters.push(tx);
            if c.state == ConnectionState::Disconnecting {
                return GattFuture::pending(rx, |_| Ok(()));
            }

            c.state = ConnectionState::Disconnecting;
            let lost = c.queue.fail_all(GattError::ConnectionLost);
            if lost > 0 {
                info!("Failed {} queued operations on {}: disconnecting", lost, device_id);
            }
            if let Some(waiter) = c.connect_waiter.take() {
                let _ = waiter.send(Err(GattError::ConnectionFailed(
                    REASON_CONNECT_CANCELLED.to_string(),
                )));
            }
            c.subscriptions.clear();
            c.abort_timers();
            c.generation
        };
        self.emit(device_id, ConnectionState::Disconnecting, None);
        info!("Disconnecting from {}", device_id);

        match self.radio.disconnect(device_id) {
            Ok(()) => self.arm_link_timer(device_id, generation, LinkPhase::Disconnect),
            Err(e) => {
                // Nothing will confirm it; finish locally.
                warn!("Radio refused disconnect from {}: {}", device_id, e);
                self.teardown(device_id, Some(generation), None);
            }
        }

        GattFuture::pending(rx, |_| Ok(()))
    }

    fn remove_record(&self, device_id: &str, generation: u64) {
        let mut connections = self.connections.write();
        let ours = connections
            .get(device_id)
            .map(|conn| conn.lock().generation == generation)
            .unwrap_or(false);
        if ours {
            connections.remove(device_id);
        }
    }

    /// Remove the record and fail or resolve everything attached to it.
    /// With `generation` set, only that incarnation is torn down.
    fn teardown(&self, device_id: &str, generation: Option<u64>, reason: Option<String>) -> bool {
        let conn = {
            let mut connections = self.connections.write();
            let matches = connections
                .get(device_id)
                .map(|conn| generation.map_or(true, |g| conn.lock().generation == g))
                .unwrap_or(false);
            if !matches {
                return false;
            }
            connections.remove(device_id)
        };
        let conn = match conn {
            Some(conn) => conn,
            None => return false,
        };

        {
            let mut c = conn.lock();
            let previous = c.state;
            c.state = ConnectionState::Disconnected;
            c.abort_timers();

            let lost = c.queue.fail_all(GattError::ConnectionLost);
            if lost > 0 {
                info!("Failed {} queued operations on {}: connection lost", lost, device_id);
            }
            // Dropping the senders ends every notification stream.
            c.subscriptions.clear();

            if let Some(waiter) = c.connect_waiter.take() {
                let why = reason.clone().unwrap_or_else(|| REASON_LINK_LOST.to_string());
                let _ = waiter.send(Err(GattError::ConnectionFailed(why)));
            }
            for waiter in c.disconnect_waiters.drain(..) {
                let _ = waiter.send(Ok(OperationOutput::Done));
            }

            info!(
                "Disconnected from {} (was {}{})",
                device_id,
                previous,
                reason
                    .as_deref()
                    .map(|r| format!(", {}", r))
                    .unwrap_or_default()
            );
        }

        self.registry.clear_services(device_id);
        self.emit(device_id, ConnectionState::Disconnected, reason);
        true
    }

    // ========================================================================
    // TIMERS
    // ========================================================================

    fn arm_link_timer(self: &Arc<Self>, device_id: &str, generation: u64, phase: LinkPhase) {
        let delay = match phase {
            LinkPhase::Connect => self.config.connect_timeout(),
            LinkPhase::Disconnect => self.config.disconnect_timeout(),
        };
        let manager = Arc::downgrade(self);
        let id = device_id.to_string();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.on_link_timeout(&id, generation, phase);
            }
        });

        if let Some(conn) = self.get(device_id) {
            let mut c = conn.lock();
            let still_waiting = match phase {
                LinkPhase::Connect => c.state == ConnectionState::Connecting,
                LinkPhase::Disconnect => c.state == ConnectionState::Disconnecting,
            };
            if c.generation == generation && still_waiting {
                if let Some(old) = c.link_timer.replace(task.abort_handle()) {
                    old.abort();
                }
                return;
            }
        }
        // Resolved before the timer could be stored.
        task.abort();
    }

    fn on_link_timeout(&self, device_id: &str, generation: u64, phase: LinkPhase) {
        let state = match self.get(device_id) {
            Some(conn) => {
                let c = conn.lock();
                if c.generation != generation {
                    return;
                }
                c.state
            }
            None => return,
        };

        match (phase, state) {
            (LinkPhase::Connect, ConnectionState::Connecting) => {
                warn!("Connect to {} timed out", device_id);
                if let Err(e) = self.radio.disconnect(device_id) {
                    debug!("Cancel of connect to {} refused: {}", device_id, e);
                }
                self.teardown(
                    device_id,
                    Some(generation),
                    Some(REASON_CONNECT_TIMEOUT.to_string()),
                );
            }
            (LinkPhase::Disconnect, ConnectionState::Disconnecting) => {
                warn!("Disconnect from {} not confirmed; completing locally", device_id);
                self.teardown(device_id, Some(generation), None);
            }
            _ => {}
        }
    }

    fn spawn_op_timer(
        self: &Arc<Self>,
        device_id: &str,
        generation: u64,
        op: OperationId,
        timeout: Duration,
    ) -> AbortHandle {
        let manager: Weak<Self> = Arc::downgrade(self);
        let id = device_id.to_string();
        self.runtime
            .spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(manager) = manager.upgrade() {
                    manager.on_operation_timeout(&id, generation, op);
                }
            })
            .abort_handle()
    }

    fn on_operation_timeout(self: &Arc<Self>, device_id: &str, generation: u64, op: OperationId) {
        let conn = match self.get(device_id) {
            Some(conn) if conn.lock().generation == generation => conn,
            _ => return,
        };
        if self.finish(&conn, op, Err(GattError::OperationTimeout)) {
            warn!("Operation #{} on {} timed out", op, device_id);
            self.pump(&conn);
        }
    }

    // ========================================================================
    // GATT OPERATIONS
    // ========================================================================

    pub fn discover_services(
        self: &Arc<Self>,
        device_id: &str,
        timeout: Option<Duration>,
    ) -> GattFuture<Vec<Service>> {
        match self.submit(device_id, OperationKind::Discover, None, Vec::new(), timeout, None) {
            Ok(rx) => GattFuture::pending(rx, |output| match output {
                OperationOutput::Services(services) => Ok(services),
                other => Err(unexpected_output(OperationKind::Discover, other)),
            }),
            Err(e) => GattFuture::failed(e),
        }
    }

    pub fn read(
        self: &Arc<Self>,
        device_id: &str,
        target: CharacteristicRef,
        timeout: Option<Duration>,
    ) -> GattFuture<Vec<u8>> {
        match self.submit(
            device_id,
            OperationKind::Read,
            Some(target),
            Vec::new(),
            timeout,
            None,
        ) {
            Ok(rx) => GattFuture::pending(rx, |output| match output {
                OperationOutput::Value(value) => Ok(value),
                OperationOutput::Done => Ok(Vec::new()),
                other => Err(unexpected_output(OperationKind::Read, other)),
            }),
            Err(e) => GattFuture::failed(e),
        }
    }

    pub fn write(
        self: &Arc<Self>,
        device_id: &str,
        target: CharacteristicRef,
        data: Vec<u8>,
        with_response: bool,
        timeout: Option<Duration>,
    ) -> GattFuture<()> {
        let kind = OperationKind::Write { with_response };
        match self.submit(device_id, kind, Some(target), data, timeout, None) {
            Ok(rx) => GattFuture::pending(rx, |_| Ok(())),
            Err(e) => GattFuture::failed(e),
        }
    }

    pub fn subscribe(
        self: &Arc<Self>,
        device_id: &str,
        target: CharacteristicRef,
        timeout: Option<Duration>,
    ) -> GattFuture<NotificationStream> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        match self.submit(
            device_id,
            OperationKind::Subscribe,
            Some(target.clone()),
            Vec::new(),
            timeout,
            Some(notify_tx),
        ) {
            Ok(rx) => {
                let device_id = device_id.to_string();
                GattFuture::pending(rx, move |_| {
                    Ok(NotificationStream::new(&device_id, target, notify_rx))
                })
            }
            Err(e) => GattFuture::failed(e),
        }
    }

    pub fn unsubscribe(
        self: &Arc<Self>,
        device_id: &str,
        target: CharacteristicRef,
        timeout: Option<Duration>,
    ) -> GattFuture<()> {
        match self.submit(
            device_id,
            OperationKind::Unsubscribe,
            Some(target),
            Vec::new(),
            timeout,
            None,
        ) {
            Ok(rx) => GattFuture::pending(rx, |_| Ok(())),
            Err(e) => GattFuture::failed(e),
        }
    }

    /// Validate, enqueue and kick the queue. Every check happens before the
    /// operation exists, so a rejected call never touches the queue.
    fn submit(
        self: &Arc<Self>,
        device_id: &str,
        kind: OperationKind,
        target: Option<CharacteristicRef>,
        payload: Vec<u8>,
        timeout: Option<Duration>,
        notify_tx: Option<mpsc::UnboundedSender<Notification>>,
    ) -> Result<oneshot::Receiver<OperationResult>, GattError> {
        if !self.radio.is_enabled() {
            return Err(GattError::RadioUnavailable);
        }
        let conn = self
            .get(device_id)
            .ok_or_else(|| GattError::NotConnected(device_id.to_string()))?;
        check_accepts(&conn.lock(), kind)?;

        if let Some(target) = &target {
            let characteristic = self
                .registry
                .characteristic(device_id, target)
                .ok_or_else(|| GattError::UnknownCharacteristic(target.to_string()))?;
            kind.check_properties(&characteristic.properties)?;
        }

        let op_id = self.next_op.fetch_add(1, Ordering::Relaxed);
        let (mut op, rx) = PendingOperation::new(
            op_id,
            kind,
            device_id,
            timeout.unwrap_or_else(|| self.config.operation_timeout()),
        );
        op = op.with_payload(payload);
        if let Some(target) = target {
            op = op.with_target(target);
        }
        if let Some(tx) = notify_tx {
            op = op.with_notify(tx);
        }

        {
            let mut c = conn.lock();
            // State may have moved while the lock was released.
            check_accepts(&c, kind)?;
            c.queue.enqueue(op)?;
            if kind == OperationKind::Discover {
                c.state = ConnectionState::DiscoveringServices;
            }
        }
        if kind == OperationKind::Discover {
            self.emit(device_id, ConnectionState::DiscoveringServices, None);
        }
        debug!("Queued {} #{} on {}", kind, op_id, device_id);

        self.pump(&conn);
        Ok(rx)
    }

    /// Dispatch the queue head if nothing is in flight. Synchronous radio
    /// rejections fail the head and move on to the next one.
    fn pump(self: &Arc<Self>, conn: &Arc<Mutex<Connection>>) {
        loop {
            let dispatch = {
                let mut c = conn.lock();
                if !c.state.is_connected() {
                    return;
                }
                let generation = c.generation;
                let device_id = c.device_id.clone();
                let (dispatch, timeout) = match c.queue.start_next() {
                    Some(op) => (
                        Dispatch {
                            op: op.id,
                            kind: op.kind,
                            device_id: device_id.clone(),
                            target: op.target.clone(),
                            payload: op.payload.clone(),
                        },
                        op.timeout,
                    ),
                    None => return,
                };
                // Armed before the radio call so an inline completion can cancel it.
                let timer = self.spawn_op_timer(&device_id, generation, dispatch.op, timeout);
                if let Some(old) = c.op_timer.replace(timer) {
                    old.abort();
                }
                dispatch
            };

            debug!(
                "Dispatching {} #{} to {}",
                dispatch.kind, dispatch.op, dispatch.device_id
            );
            match self.send_to_radio(&dispatch) {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        "Radio rejected {} #{} on {}: {}",
                        dispatch.kind, dispatch.op, dispatch.device_id, e
                    );
                    self.finish(conn, dispatch.op, Err(e));
                }
            }
        }
    }

    fn send_to_radio(&self, d: &Dispatch) -> Result<(), GattError> {
        let radio = &self.radio;
        let sent = match (d.kind, &d.target) {
            (OperationKind::Discover, _) => radio.discover_services(d.op, &d.device_id),
            (OperationKind::Read, Some(t)) => radio.read(d.op, &d.device_id, t),
            (OperationKind::Write { with_response }, Some(t)) => {
                radio.write(d.op, &d.device_id, t, &d.payload, with_response)
            }
            (OperationKind::Subscribe, Some(t)) => radio.subscribe(d.op, &d.device_id, t),
            (OperationKind::Unsubscribe, Some(t)) => radio.unsubscribe(d.op, &d.device_id, t),
            (kind, None) => {
                error!("{} #{} queued without a target", kind, d.op);
                return Err(GattError::Runtime(format!("{} without a target", kind)));
            }
        };
        sent.map_err(GattError::from)
    }

    /// Resolve the in-flight operation if `op_id` names it. Returns false for
    /// stale ids (timed out, flushed, or never ours).
    fn finish(
        &self,
        conn: &Arc<Mutex<Connection>>,
        op_id: OperationId,
        result: OperationResult,
    ) -> bool {
        let (op, device_id, rediscovered) = {
            let mut c = conn.lock();
            let mut op = match c.queue.take_in_flight(op_id) {
                Some(op) => op,
                None => {
                    debug!("Ignoring stale completion #{} on {}", op_id, c.device_id);
                    return false;
                }
            };
            if let Some(timer) = c.op_timer.take() {
                timer.abort();
            }

            let mut rediscovered = false;
            match (op.kind, &result) {
                (OperationKind::Discover, outcome) => {
                    if let Ok(OperationOutput::Services(services)) = outcome {
                        self.registry.set_services(&c.device_id, services.clone());
                    }
                    if c.state == ConnectionState::DiscoveringServices {
                        c.state = ConnectionState::Connected;
                        rediscovered = true;
                    }
                }
                (OperationKind::Subscribe, Ok(_)) => {
                    if let (Some(target), Some(tx)) = (op.target.clone(), op.notify_tx.take()) {
                        c.subscriptions.entry(target).or_default().push(tx);
                    }
                }
                (OperationKind::Unsubscribe, Ok(_)) => {
                    if let Some(target) = &op.target {
                        c.subscriptions.remove(target);
                    }
                }
                _ => {}
            }
            (op, c.device_id.clone(), rediscovered)
        };

        if rediscovered {
            self.emit(&device_id, ConnectionState::Connected, None);
        }
        match &result {
            Ok(_) => debug!("{} #{} on {} completed", op.kind, op.id, device_id),
            Err(e) => debug!("{} #{} on {} failed: {}", op.kind, op.id, device_id, e),
        }
        op.resolve(result);
        true
    }

    // ========================================================================
    // RADIO EVENTS
    // ========================================================================

    pub fn handle_link_event(
        self: &Arc<Self>,
        device_id: &str,
        state: LinkState,
        reason: Option<String>,
    ) {
        match state {
            LinkState::Connected => {
                let conn = match self.get(device_id) {
                    Some(conn) => conn,
                    None => {
                        warn!("Link up for {} with no pending connect", device_id);
                        return;
                    }
                };
                let waiter = {
                    let mut c = conn.lock();
                    if c.state != ConnectionState::Connecting {
                        debug!("Duplicate link-up for {} in state {}", device_id, c.state);
                        return;
                    }
                    c.state = ConnectionState::Connected;
                    if let Some(timer) = c.link_timer.take() {
                        timer.abort();
                    }
                    c.connect_waiter.take()
                };
                self.registry.mark_connected(device_id);
                self.emit(device_id, ConnectionState::Connected, None);
                info!("Connected to {}", device_id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(OperationOutput::Done));
                }
            }
            LinkState::Disconnected => {
                if !self.teardown(device_id, None, reason) {
                    debug!("Link down for {} with no connection record", device_id);
                }
            }
        }
    }

    pub fn handle_services_discovered(
        self: &Arc<Self>,
        device_id: &str,
        op: OperationId,
        result: Result<Vec<Service>, String>,
    ) {
        let outcome = result
            .map(|services| OperationOutput::Services(normalize_services(services)))
            .map_err(GattError::Rejected);
        self.complete_in_flight(device_id, op, |kind| match kind {
            OperationKind::Discover => Some(outcome),
            _ => None,
        });
    }

    pub fn handle_operation_completed(
        self: &Arc<Self>,
        device_id: &str,
        op: OperationId,
        result: Result<Option<Vec<u8>>, String>,
    ) {
        self.complete_in_flight(device_id, op, |kind| {
            Some(match (kind, result) {
                (_, Err(reason)) => Err(GattError::Rejected(reason)),
                (OperationKind::Read, Ok(value)) => {
                    Ok(OperationOutput::Value(value.unwrap_or_default()))
                }
                (OperationKind::Discover, Ok(_)) => Err(GattError::Rejected(
                    "discovery completed without a service table".to_string(),
                )),
                (_, Ok(_)) => Ok(OperationOutput::Done),
            })
        });
    }

    /// Local buffer accepted a write. Completes write-without-response only;
    /// a write with response waits for its confirmation.
    pub fn handle_write_accepted(self: &Arc<Self>, device_id: &str, op: OperationId) {
        self.complete_in_flight(device_id, op, |kind| match kind {
            OperationKind::Write {
                with_response: false,
            } => Some(Ok(OperationOutput::Done)),
            _ => None,
        });
    }

    fn complete_in_flight(
        self: &Arc<Self>,
        device_id: &str,
        op: OperationId,
        outcome: impl FnOnce(OperationKind) -> Option<OperationResult>,
    ) {
        let conn = match self.get(device_id) {
            Some(conn) => conn,
            None => {
                debug!("Completion #{} for {} after teardown", op, device_id);
                return;
            }
        };
        let kind = match conn.lock().queue.in_flight() {
            Some(in_flight) if in_flight.id == op => in_flight.kind,
            _ => {
                debug!("Ignoring stale completion #{} on {}", op, device_id);
                return;
            }
        };
        match outcome(kind) {
            Some(result) => {
                if self.finish(&conn, op, result) {
                    self.pump(&conn);
                }
            }
            None => debug!("Event does not complete {} #{} on {}", kind, op, device_id),
        }
    }

    /// Out-of-band push; never touches the queue.
    pub fn handle_notification(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        data: Vec<u8>,
    ) {
        let conn = match self.get(device_id) {
            Some(conn) => conn,
            None => {
                debug!("Notification from {} without a connection", device_id);
                return;
            }
        };
        let key = CharacteristicRef::new(service_id, characteristic_id);
        let mut c = conn.lock();
        let streams = match c.subscriptions.get_mut(&key) {
            Some(streams) => streams,
            None => {
                debug!("Notification for unsubscribed {} on {}", key, device_id);
                return;
            }
        };
        let notification = Notification {
            device_id: device_id.to_string(),
            service_id: key.service_id.clone(),
            characteristic_id: key.characteristic_id.clone(),
            value: data,
        };
        streams.retain(|tx| tx.send(notification.clone()).is_ok());
        if streams.is_empty() {
            debug!("Every notification stream for {} on {} dropped", key, device_id);
            c.subscriptions.remove(&key);
        }
    }

    /// Radio powered off: every connection is gone.
    pub fn handle_adapter_disabled(&self) {
        let ids: Vec<String> = self.connections.read().keys().cloned().collect();
        for id in ids {
            self.teardown(&id, None, Some(REASON_ADAPTER_OFF.to_string()));
        }
    }
}

fn check_accepts(conn: &Connection, kind: OperationKind) -> Result<(), GattError> {
    match (kind, conn.state) {
        (_, ConnectionState::Connected) => Ok(()),
        (OperationKind::Discover, ConnectionState::DiscoveringServices) => {
            Err(GattError::DiscoveryInProgress)
        }
        _ => Err(GattError::NotConnected(conn.device_id.clone())),
    }
}

fn normalize_services(services: Vec<Service>) -> Vec<Service> {
    services
        .into_iter()
        .map(|service| Service {
            id: normalize_uuid(&service.id),
            characteristics: service
                .characteristics
                .into_iter()
                .map(|c| Characteristic {
                    id: normalize_uuid(&c.id),
                    properties: c.properties,
                })
                .collect(),
        })
        .collect()
}

fn unexpected_output(kind: OperationKind, output: OperationOutput) -> GattError {
    GattError::Runtime(format!("{} resolved with unexpected {:?}", kind, output))
}
