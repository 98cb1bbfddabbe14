//! # asgi-server
//!
//! Serves an ASGI-style [`Application`] over HTTP/1.1.
//!
//! The runner resolves a `module:attribute` reference against a
//! [`Resolver`], runs lifespan startup, binds, and hands every accepted
//! connection to the protocol engine, which builds the request scope and
//! exchanges `receive`/`send` events with the application. A stop request
//! (usually a termination signal) drains in-flight sessions, cancels
//! stragglers after the grace period and runs lifespan shutdown.

mod acceptor;
pub mod app;
pub mod demos;
pub mod engine;
pub mod errors;
pub mod events;
pub mod lifecycle;
pub mod lifespan;
pub mod resolver;
pub mod runner;
pub mod signals;
pub mod telemetry;

pub use app::{Application, ApplicationError, FnApp, SharedApp, app_fn};
pub use engine::{
    EventReceiver, EventSender, SessionContext, SessionOutcome, serve_connection,
};
pub use errors::{BindError, LifespanError, ResolutionError, ServeError};
pub use events::{EventBus, ServerEvent};
pub use lifecycle::{LifecycleState, Server, ServerHandle, ShutdownReport};
pub use resolver::{Export, Module, Resolver};
