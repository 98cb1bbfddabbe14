use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use asgi_model::{
    HttpScope, HttpVersion, ReceiveEvent, Scope, SessionError,
};
use futures_util::FutureExt;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::channel::{EventReceiver, EventSender};
use super::request::pump_request;
use super::response::{
    Outbound, ResponseBody, ResponseSink, Settled, response_body,
};
use super::{SessionContext, SessionOutcome};
use crate::app::{ApplicationError, SharedApp, panic_message};
use crate::events::ServerEvent;

/// The session ended before a response head was produced.
#[derive(Debug, Error)]
#[error("session aborted before a response was started")]
struct SessionAborted;

struct Invocation {
    task: JoinHandle<SessionOutcome>,
    sink: Arc<AsyncMutex<ResponseSink>>,
}

struct SessionState {
    ctx: SessionContext,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    /// Child of the server-wide token.
    cancel: CancellationToken,
    /// Cuts the response short.
    abort: CancellationToken,
    transport_closed: CancellationToken,
    cancel_deadline: Mutex<Option<Instant>>,
    invocation: Mutex<Option<Invocation>>,
    rejected: Mutex<Option<String>>,
    served: Mutex<bool>,
}

impl SessionState {
    /// Completes `cancel_timeout` after the session was cancelled; every
    /// caller shares one deadline.
    async fn cancel_grace_elapsed(&self) {
        self.cancel.cancelled().await;
        let deadline = *self.cancel_deadline.lock().get_or_insert_with(|| {
            grace_deadline(Instant::now(), self.ctx.settings.cancel_timeout)
        });
        tokio::time::sleep_until(deadline).await;
    }
}

/// `now + grace`, saturating to roughly 30 years for huge timeouts.
fn grace_deadline(now: Instant, grace: Duration) -> Instant {
    now.checked_add(grace)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

/// Serves one connection: a single request, a single application
/// invocation, and whatever response the application produces.
///
/// Generic over the transport so any byte stream can stand in for a socket.
pub async fn serve_connection<IO>(
    io: IO,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    ctx: SessionContext,
) -> SessionOutcome
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = Uuid::now_v7();
    let span = info_span!("session", %id, peer = %display_addr(peer));
    run_session(id, io, peer, local, ctx).instrument(span).await
}

async fn run_session<IO>(
    id: Uuid,
    io: IO,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    ctx: SessionContext,
) -> SessionOutcome
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    ctx.bus.publish(ServerEvent::SessionOpened { id, peer });
    debug!("session opened");

    let state = Arc::new(SessionState {
        cancel: ctx.cancel.child_token(),
        ctx: ctx.clone(),
        peer,
        local,
        abort: CancellationToken::new(),
        transport_closed: CancellationToken::new(),
        cancel_deadline: Mutex::new(None),
        invocation: Mutex::new(None),
        rejected: Mutex::new(None),
        served: Mutex::new(false),
    });

    let service = {
        let state = Arc::clone(&state);
        service_fn(move |req: Request<Incoming>| {
            let state = Arc::clone(&state);
            async move { handle_request(req, state).await }
        })
    };

    let mut conn = Box::pin(
        http1::Builder::new()
            .keep_alive(false)
            .timer(TokioTimer::new())
            .serve_connection(TokioIo::new(io), service),
    );

    let conn_result = tokio::select! {
        result = conn.as_mut() => Some(result),
        _ = state.cancel_grace_elapsed() => None,
    };
    if conn_result.is_none() {
        state.abort.cancel();
    }
    // Dropping the connection future closes the transport.
    drop(conn);
    state.transport_closed.cancel();

    if let Some(Err(err)) = &conn_result {
        debug!(error = %err, "connection ended with error");
    }

    let invocation = state.invocation.lock().take();
    let rejected = state.rejected.lock().take();
    let outcome = match invocation {
        Some(Invocation { mut task, sink }) => {
            sink.lock().await.transport_closed();
            let joined = tokio::select! {
                biased;
                joined = &mut task => Some(joined),
                _ = state.cancel_grace_elapsed() => None,
            };
            match joined {
                Some(Ok(outcome)) => outcome,
                Some(Err(err)) if err.is_cancelled() => SessionOutcome::Cancelled,
                Some(Err(err)) => SessionOutcome::ApplicationError(err.to_string()),
                None => {
                    task.abort();
                    warn!("application ignored cancellation; invocation aborted");
                    SessionOutcome::Cancelled
                }
            }
        }
        None => unserved_outcome(rejected, conn_result),
    };

    report(&outcome);
    ctx.bus.publish(ServerEvent::SessionClosed {
        id,
        outcome: outcome.clone(),
    });
    outcome
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<SessionState>,
) -> Result<Response<ResponseBody>, SessionAborted> {
    {
        let mut served = state.served.lock();
        if *served {
            return Err(SessionAborted);
        }
        *served = true;
    }

    let settings = &state.ctx.settings;
    let (parts, body) = req.into_parts();
    let scope = match HttpScope::from_request_parts(
        &parts,
        state.peer,
        state.local,
        &settings.root_path,
    ) {
        Ok(scope) => scope,
        Err(err) => {
            *state.rejected.lock() = Some(err.to_string());
            return Err(SessionAborted);
        }
    };
    let access = AccessLine::new(&scope);

    let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_buffer);
    tokio::spawn(
        pump_request(body, inbound_tx, state.transport_closed.clone())
            .in_current_span(),
    );

    let (outbound_tx, mut outbound_rx) = mpsc::channel(settings.outbound_buffer);
    let sink = Arc::new(AsyncMutex::new(ResponseSink::new(
        outbound_tx,
        state.abort.clone(),
    )));
    let receive = EventReceiver::new(
        inbound_rx,
        Some(ReceiveEvent::HttpDisconnect),
        state.cancel.clone(),
    );
    let send = EventSender::new(sink.clone(), state.cancel.clone());

    let task = tokio::spawn(
        invoke(
            Arc::clone(&state.ctx.app),
            Scope::Http(scope),
            receive,
            send,
            Arc::clone(&sink),
        )
        .in_current_span(),
    );
    *state.invocation.lock() = Some(Invocation { task, sink });

    let first = tokio::select! {
        biased;
        _ = state.abort.cancelled() => None,
        message = outbound_rx.recv() => message,
    };

    match first {
        Some(Outbound::Start { status, headers }) => {
            access.log(status);
            let mut response = Response::new(response_body(
                outbound_rx,
                state.abort.clone(),
            ));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            Ok(response)
        }
        _ => Err(SessionAborted),
    }
}

type AppExit = Result<Result<(), ApplicationError>, Box<dyn Any + Send>>;

async fn invoke(
    app: SharedApp,
    scope: Scope,
    receive: EventReceiver,
    send: EventSender,
    sink: Arc<AsyncMutex<ResponseSink>>,
) -> SessionOutcome {
    let exit: AppExit = AssertUnwindSafe(app.call(scope, receive, send))
        .catch_unwind()
        .await;
    let returned_ok = matches!(exit, Ok(Ok(())));
    let settled = sink.lock().await.settle(returned_ok);
    classify(exit, settled)
}

fn classify(exit: AppExit, settled: Settled) -> SessionOutcome {
    match (exit, settled) {
        (_, Settled::Violation(err)) => SessionOutcome::ProtocolViolation(err),
        (Ok(Ok(())), Settled::Disconnected) => SessionOutcome::ClientDisconnected,
        (Ok(Ok(())), _) => SessionOutcome::Completed,
        (Ok(Err(err)), settled) => {
            if session_error(&err).is_some_and(SessionError::is_cancelled) {
                SessionOutcome::Cancelled
            } else if settled == Settled::Disconnected
                && session_error(&err).is_some()
            {
                SessionOutcome::ClientDisconnected
            } else {
                SessionOutcome::ApplicationError(format!("{err:#}"))
            }
        }
        (Err(panic), _) => SessionOutcome::ApplicationError(format!(
            "application panicked: {}",
            panic_message(panic.as_ref())
        )),
    }
}

fn session_error(err: &ApplicationError) -> Option<&SessionError> {
    err.chain().find_map(|cause| cause.downcast_ref::<SessionError>())
}

fn unserved_outcome(
    rejected: Option<String>,
    conn_result: Option<Result<(), hyper::Error>>,
) -> SessionOutcome {
    if let Some(reason) = rejected {
        return SessionOutcome::MalformedRequest(reason);
    }
    match conn_result {
        Some(Err(err)) if err.is_parse() || err.is_parse_too_large() => {
            SessionOutcome::MalformedRequest(err.to_string())
        }
        None => SessionOutcome::Cancelled,
        Some(_) => SessionOutcome::ClientDisconnected,
    }
}

fn report(outcome: &SessionOutcome) {
    match outcome {
        SessionOutcome::ApplicationError(message) => {
            error!(error = %message, "application error");
        }
        SessionOutcome::ProtocolViolation(err) => {
            warn!(error = %err, kind = err.as_label(), "protocol violation");
        }
        SessionOutcome::MalformedRequest(reason) => {
            warn!(%reason, "malformed request");
        }
        SessionOutcome::Cancelled => info!("session cancelled"),
        other => debug!(outcome = other.as_label(), "session closed"),
    }
}

fn display_addr(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "-".to_owned(), |addr| addr.to_string())
}

/// `<client> - "<METHOD> <path?query> HTTP/<ver>" <status>`
struct AccessLine {
    client: String,
    method: String,
    target: String,
    version: HttpVersion,
}

impl AccessLine {
    fn new(scope: &HttpScope) -> Self {
        Self {
            client: display_addr(scope.client()),
            method: scope.method().to_owned(),
            target: scope.target(),
            version: scope.http_version(),
        }
    }

    fn log(&self, status: StatusCode) {
        info!(
            "{} - \"{} {} HTTP/{}\" {}",
            self.client,
            self.method,
            self.target,
            self.version,
            status.as_u16()
        );
    }
}
