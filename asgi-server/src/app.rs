use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use asgi_model::Scope;
use async_trait::async_trait;

use crate::engine::{EventReceiver, EventSender};

/// Error carried out of application code.
pub type ApplicationError = anyhow::Error;

/// An ASGI application.
///
/// Invoked once per connection with an HTTP scope, and once per server run
/// with a lifespan scope unless lifespan handling is switched off.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    async fn call(
        &self,
        scope: Scope,
        receive: EventReceiver,
        send: EventSender,
    ) -> Result<(), ApplicationError>;
}

pub type SharedApp = Arc<dyn Application>;

/// Adapts an async closure into an [`Application`].
pub fn app_fn<F, Fut>(f: F) -> FnApp<F>
where
    F: Fn(Scope, EventReceiver, EventSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ApplicationError>> + Send + 'static,
{
    FnApp(f)
}

pub struct FnApp<F>(F);

impl<F> fmt::Debug for FnApp<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnApp").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Application for FnApp<F>
where
    F: Fn(Scope, EventReceiver, EventSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ApplicationError>> + Send + 'static,
{
    async fn call(
        &self,
        scope: Scope,
        receive: EventReceiver,
        send: EventSender,
    ) -> Result<(), ApplicationError> {
        (self.0)(scope, receive, send).await
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
