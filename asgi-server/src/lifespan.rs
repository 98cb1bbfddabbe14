//! The lifespan conversation run around serving.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use asgi_config::LifespanMode;
use asgi_model::{
    LifespanScope, ProtocolError, ReceiveEvent, Scope, SendEvent, SessionError,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::app::{SharedApp, panic_message};
use crate::engine::{EventReceiver, EventSender, OutboundSink};
use crate::errors::LifespanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Startup,
    Running,
    Shutdown,
    Done,
}

impl Phase {
    fn describe(self) -> &'static str {
        match self {
            Phase::Startup => "lifespan startup is pending",
            Phase::Running => "the application is running",
            Phase::Shutdown => "lifespan shutdown is pending",
            Phase::Done => "lifespan is finished",
        }
    }
}

/// Accepts exactly one reply per lifespan request and forwards it to the
/// coordinator.
#[derive(Debug)]
struct LifespanSink {
    phase: Phase,
    replies: mpsc::Sender<SendEvent>,
}

#[async_trait]
impl OutboundSink for LifespanSink {
    async fn accept(&mut self, event: SendEvent) -> Result<(), SessionError> {
        let kind = event.kind().to_owned();
        let next = match (self.phase, &event) {
            (_, SendEvent::Extension(_)) => {
                return Err(ProtocolError::UnsupportedEvent { kind }.into());
            }
            (Phase::Startup, SendEvent::LifespanStartupComplete) => Phase::Running,
            (Phase::Startup, SendEvent::LifespanStartupFailed { .. }) => Phase::Done,
            (
                Phase::Shutdown,
                SendEvent::LifespanShutdownComplete
                | SendEvent::LifespanShutdownFailed { .. },
            ) => Phase::Done,
            (phase, _) => {
                return Err(ProtocolError::UnexpectedEvent {
                    state: phase.describe(),
                    kind,
                }
                .into());
            }
        };

        self.replies
            .send(event)
            .await
            .map_err(|_| ProtocolError::SessionClosed { kind })?;
        self.phase = next;
        Ok(())
    }
}

/// A lifespan conversation that completed startup and awaits shutdown.
pub struct Lifespan {
    mode: LifespanMode,
    inbound: mpsc::Sender<ReceiveEvent>,
    replies: mpsc::Receiver<SendEvent>,
    sink: Arc<Mutex<LifespanSink>>,
    task: JoinHandle<Result<(), String>>,
    cancel: CancellationToken,
}

impl Lifespan {
    /// Runs lifespan startup.
    ///
    /// Returns `None` when lifespan is off, or when the application does not
    /// take part in it and `mode` is `auto`. A reported startup failure is
    /// fatal in every mode.
    ///
    /// Cancelling `stop` while startup is pending cancels the application,
    /// aborts it after `cancel_timeout` and yields
    /// [`LifespanError::Interrupted`].
    pub async fn startup(
        app: SharedApp,
        mode: LifespanMode,
        stop: &CancellationToken,
        cancel_timeout: Duration,
    ) -> Result<Option<Self>, LifespanError> {
        if mode == LifespanMode::Off {
            debug!("lifespan disabled");
            return Ok(None);
        }

        let (inbound, inbound_rx) = mpsc::channel(2);
        let (replies_tx, mut replies) = mpsc::channel(2);
        let cancel = CancellationToken::new();
        let sink = Arc::new(Mutex::new(LifespanSink {
            phase: Phase::Startup,
            replies: replies_tx,
        }));
        let receive = EventReceiver::new(inbound_rx, None, cancel.clone());
        let send = EventSender::new(sink.clone(), cancel.clone());
        let mut task = tokio::spawn(
            run_lifespan_app(app, receive, send)
                .instrument(info_span!("lifespan")),
        );

        let _ = inbound.send(ReceiveEvent::LifespanStartup).await;

        tokio::select! {
            biased;
            reply = replies.recv() => match reply {
                Some(SendEvent::LifespanStartupComplete) => {
                    info!("application startup complete");
                    Ok(Some(Self {
                        mode,
                        inbound,
                        replies,
                        sink,
                        task,
                        cancel,
                    }))
                }
                Some(SendEvent::LifespanStartupFailed { message }) => {
                    error!(%message, "application startup failed");
                    cancel.cancel();
                    task.abort();
                    Err(LifespanError::StartupFailed(message))
                }
                other => {
                    task.abort();
                    Err(LifespanError::Unsupported(format!(
                        "unexpected startup reply {other:?}"
                    )))
                }
            },
            exit = &mut task => {
                let reason = exit_reason(exit, "startup");
                if mode == LifespanMode::On {
                    error!(%reason, "lifespan startup did not complete");
                    Err(LifespanError::Unsupported(reason))
                } else {
                    info!(%reason, "lifespan not supported by application; continuing without it");
                    Ok(None)
                }
            }
            _ = stop.cancelled() => {
                info!("stop requested during lifespan startup");
                cancel.cancel();
                if tokio::time::timeout(cancel_timeout, &mut task).await.is_err() {
                    warn!("lifespan task ignored cancellation; aborting");
                    task.abort();
                }
                Err(LifespanError::Interrupted)
            }
        }
    }

    /// Runs lifespan shutdown, bounded by `timeout`; then gives the
    /// application `cancel_timeout` to return before aborting it.
    pub async fn shutdown(
        self,
        timeout: Duration,
        cancel_timeout: Duration,
    ) -> Result<(), LifespanError> {
        let Lifespan {
            mode,
            inbound,
            mut replies,
            sink,
            mut task,
            cancel,
        } = self;

        sink.lock().await.phase = Phase::Shutdown;
        let _ = inbound.send(ReceiveEvent::LifespanShutdown).await;

        let mut task_done = false;
        let result = tokio::time::timeout(timeout, async {
            tokio::select! {
                biased;
                reply = replies.recv() => match reply {
                    Some(SendEvent::LifespanShutdownComplete) => {
                        info!("application shutdown complete");
                        Ok(())
                    }
                    Some(SendEvent::LifespanShutdownFailed { message }) => {
                        error!(%message, "application shutdown failed");
                        Err(LifespanError::ShutdownFailed(message))
                    }
                    other => Err(LifespanError::Unsupported(format!(
                        "unexpected shutdown reply {other:?}"
                    ))),
                },
                exit = &mut task => {
                    task_done = true;
                    let reason = exit_reason(exit, "shutdown");
                    if mode == LifespanMode::On {
                        Err(LifespanError::Unsupported(reason))
                    } else {
                        debug!(%reason, "lifespan ended before shutdown reply");
                        Ok(())
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            warn!(?timeout, "lifespan shutdown timed out");
            Err(LifespanError::ShutdownTimedOut)
        });

        cancel.cancel();
        if !task_done
            && tokio::time::timeout(cancel_timeout, &mut task).await.is_err()
        {
            warn!("lifespan task ignored cancellation; aborting");
            task.abort();
        }
        result
    }
}

impl fmt::Debug for Lifespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifespan")
            .field("mode", &self.mode)
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

async fn run_lifespan_app(
    app: SharedApp,
    receive: EventReceiver,
    send: EventSender,
) -> Result<(), String> {
    let scope = Scope::Lifespan(LifespanScope::new());
    match AssertUnwindSafe(app.call(scope, receive, send))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(panic) => Err(format!(
            "application panicked: {}",
            panic_message(panic.as_ref())
        )),
    }
}

fn exit_reason(
    exit: Result<Result<(), String>, tokio::task::JoinError>,
    phase: &str,
) -> String {
    match exit {
        Ok(Ok(())) => format!("application returned during lifespan {phase}"),
        Ok(Err(reason)) => reason,
        Err(err) => err.to_string(),
    }
}
