//! Server lifecycle: `Starting -> Running -> Draining -> Stopped`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use asgi_config::{Settings, SettingsError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::acceptor::{Acceptor, ConnectionGauge};
use crate::app::SharedApp;
use crate::engine::SessionContext;
use crate::errors::{LifespanError, ServeError};
use crate::events::{EventBus, ServerEvent};
use crate::lifespan::Lifespan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the drain went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions that finished on their own during the grace period.
    pub completed: usize,
    /// Sessions still running when the grace period elapsed.
    pub cancelled: usize,
}

struct HandleInner {
    state: watch::Sender<LifecycleState>,
    stop: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

/// Cloneable control surface of a [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

impl ServerHandle {
    fn new() -> Self {
        let (state, _rx) = watch::channel(LifecycleState::Starting);
        Self {
            inner: Arc::new(HandleInner {
                state,
                stop: CancellationToken::new(),
                local_addr: OnceLock::new(),
            }),
        }
    }

    /// Requests a graceful drain. Safe to call any number of times, from
    /// any state.
    pub fn stop(&self) {
        if self.inner.stop.is_cancelled() {
            debug!(state = %self.state(), "stop already requested");
            return;
        }
        info!(state = %self.state(), "stop requested");
        self.inner.stop.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// Waits until the server reaches `target` or any later state, and
    /// returns the state it found.
    pub async fn wait_for_state(&self, target: LifecycleState) -> LifecycleState {
        let mut rx = self.subscribe();
        match rx.wait_for(|state| *state >= target).await {
            Ok(state) => *state,
            // The sender lives in `inner`, which this handle keeps alive.
            Err(_) => self.state(),
        }
    }

    /// Waits for the server to start serving and returns its bound address,
    /// or `None` if it stopped without ever serving.
    pub async fn ready(&self) -> Option<SocketAddr> {
        match self.wait_for_state(LifecycleState::Running).await {
            LifecycleState::Running | LifecycleState::Draining => {
                self.local_addr()
            }
            _ => None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("state", &self.state())
            .field("stop_requested", &self.is_stop_requested())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// One server run: lifespan startup, serving, drain, lifespan shutdown.
pub struct Server {
    settings: Arc<Settings>,
    app: SharedApp,
    bus: Arc<EventBus>,
    handle: ServerHandle,
}

impl Server {
    pub fn new(settings: Settings, app: SharedApp) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            settings: Arc::new(settings),
            app,
            bus: Arc::new(EventBus::default()),
            handle: ServerHandle::new(),
        })
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Runs the server until [`ServerHandle::stop`] is called and the drain
    /// completes.
    ///
    /// Fails before serving when lifespan startup fails or the listening
    /// socket cannot be bound; the server is `Stopped` either way. A stop
    /// requested during lifespan startup ends the run with an empty report.
    pub async fn run(self) -> Result<ShutdownReport, ServeError> {
        let Server {
            settings,
            app,
            bus,
            handle,
        } = self;
        let states = StatePublisher {
            handle: &handle,
            bus: &bus,
        };
        states.enter(LifecycleState::Starting);

        let lifespan = match Lifespan::startup(
            Arc::clone(&app),
            settings.lifespan,
            &handle.inner.stop,
            settings.cancel_timeout,
        )
        .await
        {
            Ok(lifespan) => lifespan,
            Err(LifespanError::Interrupted) => {
                info!("stopped before serving");
                states.enter(LifecycleState::Stopped);
                return Ok(ShutdownReport::default());
            }
            Err(err) => {
                error!(error = %err, "lifespan startup failed");
                states.enter(LifecycleState::Stopped);
                return Err(err.into());
            }
        };

        let acceptor = match Acceptor::bind(&settings).await {
            Ok(acceptor) => acceptor,
            Err(err) => {
                error!(error = %err, "bind failed");
                shutdown_lifespan(lifespan, &settings).await;
                states.enter(LifecycleState::Stopped);
                return Err(err.into());
            }
        };
        let _ = handle.inner.local_addr.set(acceptor.local_addr());

        let sessions = CancellationToken::new();
        let ctx = SessionContext::new(
            app,
            Arc::clone(&settings),
            Arc::clone(&bus),
            sessions.clone(),
        );
        let tracker = TaskTracker::new();
        let gauge = ConnectionGauge::default();
        let accept_stop = acceptor.stop_token();
        let accept_task =
            tokio::spawn(acceptor.run(ctx, tracker.clone(), gauge.clone()));
        states.enter(LifecycleState::Running);

        handle.inner.stop.cancelled().await;
        states.enter(LifecycleState::Draining);
        accept_stop.cancel();
        if let Err(err) = accept_task.await {
            warn!(error = %err, "accept loop failed");
        }

        tracker.close();
        let in_flight = gauge.current();
        info!(
            in_flight,
            grace = ?settings.graceful_timeout,
            "draining sessions"
        );
        let mut cancelled = 0;
        if tokio::time::timeout(settings.graceful_timeout, tracker.wait())
            .await
            .is_err()
        {
            cancelled = gauge.current();
            warn!(cancelled, "grace period elapsed; cancelling sessions");
            sessions.cancel();
            tracker.wait().await;
        }
        let report = ShutdownReport {
            completed: in_flight.saturating_sub(cancelled),
            cancelled,
        };

        shutdown_lifespan(lifespan, &settings).await;
        states.enter(LifecycleState::Stopped);
        Ok(report)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("settings", &self.settings)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

struct StatePublisher<'a> {
    handle: &'a ServerHandle,
    bus: &'a EventBus,
}

impl StatePublisher<'_> {
    fn enter(&self, state: LifecycleState) {
        self.handle.inner.state.send_replace(state);
        self.bus.publish(ServerEvent::Lifecycle(state));
        info!(%state, "server state changed");
    }
}

/// Failures here are logged; the drain already happened.
async fn shutdown_lifespan(lifespan: Option<Lifespan>, settings: &Settings) {
    let Some(lifespan) = lifespan else {
        return;
    };
    if let Err(err) = lifespan
        .shutdown(settings.graceful_timeout, settings.cancel_timeout)
        .await
    {
        warn!(error = %err, "lifespan shutdown failed");
    }
}
