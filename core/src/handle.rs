//! Caller-side handles: completion futures and notification streams.

use crate::error::{GattError, OperationStatus};
use crate::model::{CharacteristicRef, Notification};
use crate::queue::{OperationOutput, OperationResult};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

type OutputMap<T> = Box<dyn FnOnce(OperationOutput) -> Result<T, GattError> + Send>;

enum FutureState<T> {
    Ready(Option<Result<T, GattError>>),
    Pending {
        rx: oneshot::Receiver<OperationResult>,
        map: Option<OutputMap<T>>,
    },
}

/// Resolves once the operation it was created for completes.
///
/// Created eagerly: by the time the caller holds one, the request was either
/// validated and queued or has already failed.
#[must_use = "dropping a GattFuture discards the operation's outcome"]
pub struct GattFuture<T> {
    state: FutureState<T>,
}

impl<T> GattFuture<T> {
    pub fn ready(result: Result<T, GattError>) -> Self {
        Self {
            state: FutureState::Ready(Some(result)),
        }
    }

    pub fn failed(error: GattError) -> Self {
        Self::ready(Err(error))
    }

    pub(crate) fn pending(
        rx: oneshot::Receiver<OperationResult>,
        map: impl FnOnce(OperationOutput) -> Result<T, GattError> + Send + 'static,
    ) -> Self {
        Self {
            state: FutureState::Pending {
                rx,
                map: Some(Box::new(map)),
            },
        }
    }

    /// Await and flatten into the `(success, message)` shape binding
    /// callbacks expect.
    pub async fn status(self) -> OperationStatus {
        OperationStatus::from(&self.await)
    }
}

impl<T> Unpin for GattFuture<T> {}

impl<T> Future for GattFuture<T> {
    type Output = Result<T, GattError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            FutureState::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or_else(|| Err(GattError::Runtime("future polled after completion".into()))),
            ),
            FutureState::Pending { rx, map } => match Pin::new(rx).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(Ok(output))) => match map.take() {
                    Some(map) => Poll::Ready(map(output)),
                    None => Poll::Ready(Err(GattError::Runtime(
                        "future polled after completion".into(),
                    ))),
                },
                Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e)),
                // Completion dropped without an answer: the owning queue is gone.
                Poll::Ready(Err(_)) => Poll::Ready(Err(GattError::ConnectionLost)),
            },
        }
    }
}

impl<T> std::fmt::Debug for GattFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            FutureState::Ready(_) => "ready",
            FutureState::Pending { .. } => "pending",
        };
        f.debug_struct("GattFuture").field("state", &state).finish()
    }
}

/// Values pushed by the peripheral for one subscribed characteristic.
///
/// Ends when the subscription is removed or the connection goes away.
#[derive(Debug)]
pub struct NotificationStream {
    device_id: String,
    target: CharacteristicRef,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl NotificationStream {
    pub(crate) fn new(
        device_id: &str,
        target: CharacteristicRef,
        rx: mpsc::UnboundedReceiver<Notification>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            target,
            rx,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn target(&self) -> &CharacteristicRef {
        &self.target
    }

    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}

impl Stream for NotificationStream {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Notification>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, assert_ready_eq, task};

    #[test]
    fn test_ready_future_resolves_immediately() {
        let mut fut = task::spawn(GattFuture::<()>::failed(GattError::QueueFull));
        assert_ready_eq!(fut.poll(), Err(GattError::QueueFull));
    }

    #[test]
    fn test_pending_future_maps_output() {
        let (tx, rx) = oneshot::channel();
        let mut fut = task::spawn(GattFuture::pending(rx, |output| match output {
            OperationOutput::Value(v) => Ok(v),
            other => Err(GattError::Runtime(format!("unexpected {:?}", other))),
        }));

        assert_pending!(fut.poll());
        tx.send(Ok(OperationOutput::Value(vec![0x2A])))
            .expect("receiver alive");
        assert!(fut.is_woken());
        assert_ready_eq!(fut.poll(), Ok(vec![0x2A]));
    }

    #[test]
    fn test_dropped_completion_is_connection_lost() {
        let (tx, rx) = oneshot::channel::<OperationResult>();
        let mut fut = task::spawn(GattFuture::pending(rx, |_| Ok(())));
        drop(tx);
        let result = assert_ready!(fut.poll());
        assert_eq!(result, Err(GattError::ConnectionLost));
    }

    #[tokio::test]
    async fn test_status_shape() {
        let status = GattFuture::<()>::failed(GattError::OperationTimeout)
            .status()
            .await;
        assert!(!status.success);
        assert_eq!(status.message, "Operation timed out");

        assert!(GattFuture::ready(Ok(())).status().await.success);
    }

    #[tokio::test]
    async fn test_notification_stream_ends_with_sender() {
        use futures::StreamExt;

        let (tx, rx) = mpsc::unbounded_channel();
        let target = CharacteristicRef::new("180D", "2A37");
        let mut stream = NotificationStream::new("AA", target.clone(), rx);

        tx.send(Notification {
            device_id: "AA".into(),
            service_id: target.service_id.clone(),
            characteristic_id: target.characteristic_id.clone(),
            value: vec![0x06, 0x48],
        })
        .expect("stream alive");
        drop(tx);

        assert_eq!(
            stream.next().await.map(|n| n.value),
            Some(vec![0x06, 0x48])
        );
        assert!(stream.next().await.is_none());
    }
}
