//! The per-connection protocol engine.
//!
//! One accepted connection is one session: hyper parses a single request,
//! the engine builds its [`HttpScope`](asgi_model::HttpScope), invokes the
//! application once with `receive`/`send` handles bound to the connection,
//! and turns the accepted outbound events into the HTTP response.

mod channel;
mod request;
mod response;
mod session;

use std::fmt;
use std::sync::Arc;

use asgi_config::Settings;
use asgi_model::ProtocolError;
use tokio_util::sync::CancellationToken;

use crate::app::SharedApp;
use crate::events::EventBus;

pub use channel::{EventReceiver, EventSender};
pub(crate) use channel::OutboundSink;
pub use session::serve_connection;

/// How a session ended. Reported once per session, in the log and on the
/// event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The response was delivered in full.
    Completed,
    /// The peer went away, before sending a request or mid-exchange.
    ClientDisconnected,
    /// Request framing or scope construction failed; the application was
    /// never invoked.
    MalformedRequest(String),
    /// The application broke the event protocol.
    ProtocolViolation(ProtocolError),
    /// The application failed or panicked.
    ApplicationError(String),
    /// The server cancelled the session during shutdown.
    Cancelled,
}

impl SessionOutcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::ClientDisconnected => "client_disconnected",
            SessionOutcome::MalformedRequest(_) => "malformed_request",
            SessionOutcome::ProtocolViolation(_) => "protocol_violation",
            SessionOutcome::ApplicationError(_) => "application_error",
            SessionOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::MalformedRequest(reason) => {
                write!(f, "malformed request: {reason}")
            }
            SessionOutcome::ProtocolViolation(err) => {
                write!(f, "protocol violation: {err}")
            }
            SessionOutcome::ApplicationError(message) => {
                write!(f, "application error: {message}")
            }
            other => f.write_str(other.as_label()),
        }
    }
}

/// Everything a session shares with the rest of the server.
#[derive(Clone)]
pub struct SessionContext {
    pub(crate) app: SharedApp,
    pub(crate) settings: Arc<Settings>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) cancel: CancellationToken,
}

impl SessionContext {
    /// `cancel` is the server-wide session token; cancelling it makes every
    /// pending and future `receive`/`send` fail with `Cancelled`.
    pub fn new(
        app: SharedApp,
        settings: Arc<Settings>,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            app,
            settings,
            bus,
            cancel,
        }
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("settings", &self.settings)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
