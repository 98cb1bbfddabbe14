//! Built-in demonstration modules, importable as `hello:app` and `echo:app`.

use asgi_model::{ReceiveEvent, Scope, SendEvent};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use crate::app::{Application, ApplicationError};
use crate::engine::{EventReceiver, EventSender};
use crate::resolver::{Module, Resolver};

pub const HELLO_BODY: &[u8] = br#"{"hello": "world"}"#;

pub(crate) fn register(resolver: &mut Resolver) {
    resolver.register("hello", || {
        Ok(Module::new()
            .with_app("app", HelloWorld)
            .with_value("GREETING", json!("hello, world")))
    });
    resolver.register("echo", || Ok(Module::new().with_app("app", Echo)));
}

/// Answers every request with a fixed JSON document and implements the
/// lifespan protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct HelloWorld;

#[async_trait]
impl Application for HelloWorld {
    async fn call(
        &self,
        scope: Scope,
        receive: EventReceiver,
        send: EventSender,
    ) -> Result<(), ApplicationError> {
        if let Scope::Lifespan(_) = scope {
            return run_lifespan(receive, send).await;
        }

        send.send(SendEvent::start(
            200,
            vec![
                (
                    Bytes::from_static(b"content-type"),
                    Bytes::from_static(b"application/json"),
                ),
                (
                    Bytes::from_static(b"content-length"),
                    Bytes::from(HELLO_BODY.len().to_string()),
                ),
            ],
        ))
        .await?;
        send.send(SendEvent::body(Bytes::from_static(HELLO_BODY), false))
            .await?;
        Ok(())
    }
}

async fn run_lifespan(
    receive: EventReceiver,
    send: EventSender,
) -> Result<(), ApplicationError> {
    loop {
        match receive.receive().await? {
            ReceiveEvent::LifespanStartup => {
                send.send(SendEvent::LifespanStartupComplete).await?;
            }
            ReceiveEvent::LifespanShutdown => {
                send.send(SendEvent::LifespanShutdownComplete).await?;
                return Ok(());
            }
            other => anyhow::bail!("unexpected `{}` in lifespan", other.kind()),
        }
    }
}

/// Streams the request body back chunk by chunk. Does not implement
/// lifespan.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

#[async_trait]
impl Application for Echo {
    async fn call(
        &self,
        scope: Scope,
        receive: EventReceiver,
        send: EventSender,
    ) -> Result<(), ApplicationError> {
        let Scope::Http(scope) = scope else {
            anyhow::bail!("echo only serves http scopes");
        };

        let content_type = scope
            .header("content-type")
            .map(Bytes::copy_from_slice)
            .unwrap_or_else(|| Bytes::from_static(b"application/octet-stream"));
        send.send(SendEvent::start(
            200,
            vec![(Bytes::from_static(b"content-type"), content_type)],
        ))
        .await?;

        loop {
            match receive.receive().await? {
                ReceiveEvent::HttpRequest { body, more_body } => {
                    send.send(SendEvent::body(body, more_body)).await?;
                    if !more_body {
                        return Ok(());
                    }
                }
                ReceiveEvent::HttpDisconnect => return Ok(()),
                other => {
                    anyhow::bail!("unexpected `{}` in http scope", other.kind())
                }
            }
        }
    }
}
