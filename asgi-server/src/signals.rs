//! Termination signals feeding [`ServerHandle::stop`].
//!
//! On Unix SIGINT, SIGTERM and SIGQUIT are handled; elsewhere only Ctrl-C.

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::lifecycle::ServerHandle;

/// Listens for termination signals until aborted.
///
/// The first signal starts a graceful drain; later ones are logged and
/// otherwise ignored.
pub fn spawn_signal_listener(handle: ServerHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut signals = match ShutdownSignals::install() {
            Ok(signals) => signals,
            Err(err) => {
                warn!(error = %err, "failed to install signal handlers");
                return;
            }
        };

        let mut received = 0_u32;
        loop {
            let name = signals.recv().await;
            received += 1;
            if received == 1 {
                info!(signal = name, "shutdown signal received; draining");
                handle.stop();
            } else {
                info!(
                    signal = name,
                    received, "shutdown already in progress; signal ignored"
                );
            }
        }
    })
}

#[cfg(unix)]
struct ShutdownSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sigquit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigquit.recv() => "SIGQUIT",
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "ctrl-c",
            Err(err) => {
                warn!(error = %err, "ctrl-c listener failed");
                std::future::pending().await
            }
        }
    }
}
