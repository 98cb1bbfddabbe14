//! TCP acceptor: binds the listening socket and hands every accepted
//! connection to its own session task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use asgi_config::Settings;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::engine::{SessionContext, serve_connection};
use crate::errors::BindError;
use crate::events::ServerEvent;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Number of live sessions, shared between the acceptor and its sessions.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectionGauge(Arc<AtomicUsize>);

impl ConnectionGauge {
    pub(crate) fn current(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn enter(&self) -> GaugeGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        GaugeGuard(self.clone())
    }
}

/// Releases its slot in the gauge on drop, whichever way the session ends.
#[derive(Debug)]
struct GaugeGuard(ConnectionGauge);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        (self.0).0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub(crate) struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    stop: CancellationToken,
    max_connections: Option<usize>,
}

impl Acceptor {
    pub(crate) async fn bind(settings: &Settings) -> Result<Self, BindError> {
        let target = settings.bind_target();
        let io_error = |source| BindError::Io {
            target: target.clone(),
            source,
        };
        let listener = TcpListener::bind(&target).await.map_err(io_error)?;
        let local_addr = listener.local_addr().map_err(io_error)?;
        info!(%local_addr, "listening");

        Ok(Self {
            listener,
            local_addr,
            stop: CancellationToken::new(),
            max_connections: settings.max_connections,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token that ends the accept loop when cancelled. Sessions already
    /// spawned keep running.
    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Accepts until stopped, spawning one session per connection on
    /// `tracker`. The listening socket is closed when this returns.
    pub(crate) async fn run(
        self,
        ctx: SessionContext,
        tracker: TaskTracker,
        gauge: ConnectionGauge,
    ) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    // Usually descriptor exhaustion; give sessions a moment
                    // to release theirs.
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            if self
                .max_connections
                .is_some_and(|limit| gauge.current() >= limit)
            {
                debug!(%peer, "refusing connection; limit reached");
                ctx.bus.publish(ServerEvent::ConnectionRefused { peer });
                drop(socket);
                continue;
            }

            self.spawn_session(socket, peer, &ctx, &tracker, &gauge);
        }
        debug!("accept loop stopped");
    }

    fn spawn_session(
        &self,
        socket: TcpStream,
        peer: SocketAddr,
        ctx: &SessionContext,
        tracker: &TaskTracker,
        gauge: &ConnectionGauge,
    ) {
        if let Err(err) = socket.set_nodelay(true) {
            debug!(%peer, error = %err, "failed to set TCP_NODELAY");
        }
        let guard = gauge.enter();
        let ctx = ctx.clone();
        let local = Some(self.local_addr);
        tracker.spawn(async move {
            let _guard = guard;
            serve_connection(socket, Some(peer), local, ctx).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_guard_releases_its_slot() {
        let gauge = ConnectionGauge::default();
        let first = gauge.enter();
        let second = gauge.enter();
        assert_eq!(gauge.current(), 2);

        drop(first);
        assert_eq!(gauge.current(), 1);
        drop(second);
        assert_eq!(gauge.current(), 0);
    }

    #[tokio::test]
    async fn binding_a_taken_port_fails() {
        let taken = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = taken.local_addr().expect("addr").port();
        let settings = Settings {
            host: "127.0.0.1".into(),
            port,
            ..Settings::default()
        };

        let err = Acceptor::bind(&settings).await.expect_err("port is taken");
        let BindError::Io { target, .. } = err;
        assert_eq!(target, format!("127.0.0.1:{port}"));
    }
}
