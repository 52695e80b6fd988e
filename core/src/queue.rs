/// Per-connection GATT operation queue
///
/// A BLE link carries one outstanding GATT transaction at a time. The queue
/// holds every operation issued on a connection in FIFO order and tracks the
/// single one currently dispatched to the radio. Capacity counts the in-flight
/// operation; beyond it, enqueue fails with backpressure.
use crate::error::GattError;
use crate::model::{CharacteristicProperties, CharacteristicRef, Notification, Service};
use crate::radio::OperationId;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Successful outcome of a queued operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    Done,
    Value(Vec<u8>),
    Services(Vec<Service>),
}

pub type OperationResult = Result<OperationOutput, GattError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Discover,
    Read,
    Write { with_response: bool },
    Subscribe,
    Unsubscribe,
}

impl OperationKind {
    /// Fail fast when the characteristic lacks the property this kind needs.
    pub fn check_properties(&self, props: &CharacteristicProperties) -> Result<(), GattError> {
        let (allowed, needed) = match self {
            OperationKind::Discover => (true, ""),
            OperationKind::Read => (props.readable, "read"),
            OperationKind::Write {
                with_response: true,
            } => (props.writable, "write"),
            OperationKind::Write {
                with_response: false,
            } => (
                props.writable_without_response,
                "write without response",
            ),
            OperationKind::Subscribe | OperationKind::Unsubscribe => {
                (props.notifiable, "notify")
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(GattError::UnsupportedOperation(format!(
                "characteristic does not support {}",
                needed
            )))
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "discover"),
            Self::Read => write!(f, "read"),
            Self::Write {
                with_response: true,
            } => write!(f, "write"),
            Self::Write {
                with_response: false,
            } => write!(f, "write-without-response"),
            Self::Subscribe => write!(f, "subscribe"),
            Self::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// One GATT request, owned by its queue until resolved
#[derive(Debug)]
pub struct PendingOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub device_id: String,
    pub target: Option<CharacteristicRef>,
    pub payload: Vec<u8>,
    pub timeout: Duration,
    /// Subscribe only: where notifications go once the peripheral confirms
    pub notify_tx: Option<mpsc::UnboundedSender<Notification>>,
    completion: oneshot::Sender<OperationResult>,
}

impl PendingOperation {
    pub fn new(
        id: OperationId,
        kind: OperationKind,
        device_id: &str,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<OperationResult>) {
        let (completion, rx) = oneshot::channel();
        (
            Self {
                id,
                kind,
                device_id: device_id.to_string(),
                target: None,
                payload: Vec::new(),
                timeout,
                notify_tx: None,
                completion,
            },
            rx,
        )
    }

    pub fn with_target(mut self, target: CharacteristicRef) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_notify(mut self, tx: mpsc::UnboundedSender<Notification>) -> Self {
        self.notify_tx = Some(tx);
        self
    }

    /// Hand the outcome to whoever awaits it. A dropped receiver is fine.
    pub fn resolve(self, result: OperationResult) {
        let _ = self.completion.send(result);
    }

    pub fn fail(self, error: GattError) {
        self.resolve(Err(error));
    }
}

#[derive(Debug)]
pub struct OperationQueue {
    waiting: VecDeque<PendingOperation>,
    in_flight: Option<PendingOperation>,
    max_depth: usize,
}

impl OperationQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            waiting: VecDeque::new(),
            in_flight: None,
            max_depth,
        }
    }

    /// Queued operations including the in-flight one
    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_depth
    }

    pub fn in_flight(&self) -> Option<&PendingOperation> {
        self.in_flight.as_ref()
    }

    pub fn in_flight_id(&self) -> Option<OperationId> {
        self.in_flight.as_ref().map(|op| op.id)
    }

    /// Append to the tail. When full the operation is failed with
    /// `QueueFull` before returning the same error.
    pub fn enqueue(&mut self, op: PendingOperation) -> Result<(), GattError> {
        if self.is_full() {
            op.fail(GattError::QueueFull);
            return Err(GattError::QueueFull);
        }
        self.waiting.push_back(op);
        Ok(())
    }

    /// Promote the head to in-flight. Does nothing while one is in flight.
    pub fn start_next(&mut self) -> Option<&PendingOperation> {
        if self.in_flight.is_some() {
            return None;
        }
        self.in_flight = self.waiting.pop_front();
        self.in_flight.as_ref()
    }

    /// Take the in-flight operation if `id` names it. Anything else is stale.
    pub fn take_in_flight(&mut self, id: OperationId) -> Option<PendingOperation> {
        match &self.in_flight {
            Some(op) if op.id == id => self.in_flight.take(),
            _ => None,
        }
    }

    /// Remove everything, in-flight first, then waiting in FIFO order.
    pub fn drain(&mut self) -> Vec<PendingOperation> {
        let mut drained = Vec::with_capacity(self.len());
        drained.extend(self.in_flight.take());
        drained.extend(self.waiting.drain(..));
        drained
    }

    /// Fail every queued operation with `error`. Returns how many failed.
    pub fn fail_all(&mut self, error: GattError) -> usize {
        let drained = self.drain();
        let count = drained.len();
        for op in drained {
            op.fail(error.clone());
        }
        count
    }
}
