//! The `receive` and `send` handles given to an application invocation.

use std::fmt;
use std::sync::Arc;

use asgi_model::{ReceiveEvent, SendEvent, SessionError};
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Destination of outbound events; validates each event against the
/// protocol state of its scope before accepting it.
#[async_trait]
pub(crate) trait OutboundSink: Send {
    async fn accept(&mut self, event: SendEvent) -> Result<(), SessionError>;
}

/// Yields inbound events in arrival order.
///
/// Clones share one queue. Once the session is cancelled every pending and
/// future call fails with [`SessionError::Cancelled`].
#[derive(Clone)]
pub struct EventReceiver {
    inner: Arc<Mutex<ReceiverState>>,
    cancel: CancellationToken,
}

struct ReceiverState {
    rx: mpsc::Receiver<ReceiveEvent>,
    // Delivered once when the queue closes without having produced it.
    on_close: Option<ReceiveEvent>,
}

impl EventReceiver {
    pub(crate) fn new(
        rx: mpsc::Receiver<ReceiveEvent>,
        on_close: Option<ReceiveEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReceiverState { rx, on_close })),
            cancel,
        }
    }

    /// Waits for the next inbound event.
    ///
    /// After the final event of a scope (`http.disconnect` for HTTP) this
    /// suspends until the session is cancelled.
    pub async fn receive(&self) -> Result<ReceiveEvent, SessionError> {
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            event = self.next() => Ok(event),
        }
    }

    async fn next(&self) -> ReceiveEvent {
        let mut state = self.inner.lock().await;
        let next = state.rx.recv().await;
        match next {
            Some(event) => {
                if state.on_close.as_ref() == Some(&event) {
                    state.on_close = None;
                }
                event
            }
            None => match state.on_close.take() {
                Some(event) => event,
                None => {
                    drop(state);
                    std::future::pending().await
                }
            },
        }
    }
}

impl fmt::Debug for EventReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventReceiver")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Hands outbound events to the engine.
///
/// Sends are serialized: each one is validated and queued before the next
/// starts, so events reach the transport in call order. `send` returns once
/// the event is queued, waiting while the session's outbound queue is full.
#[derive(Clone)]
pub struct EventSender {
    sink: Arc<Mutex<dyn OutboundSink>>,
    cancel: CancellationToken,
}

impl EventSender {
    pub(crate) fn new(
        sink: Arc<Mutex<dyn OutboundSink>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { sink, cancel }
    }

    pub async fn send(&self, event: SendEvent) -> Result<(), SessionError> {
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = async {
                let mut sink = self.sink.lock().await;
                sink.accept(event).await
            } => result,
        }
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
