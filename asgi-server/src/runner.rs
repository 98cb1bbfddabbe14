//! Wires CLI arguments, the resolver and the server together.

use anyhow::Context;
use asgi_config::ServeArgs;
use tracing::info;

use crate::lifecycle::{Server, ShutdownReport};
use crate::resolver::Resolver;
use crate::signals::spawn_signal_listener;

/// Resolves the application, then serves it until a termination signal
/// completes the drain.
pub async fn run(args: ServeArgs) -> anyhow::Result<ShutdownReport> {
    run_with_resolver(args, &Resolver::with_builtin_modules()).await
}

pub async fn run_with_resolver(
    args: ServeArgs,
    resolver: &Resolver,
) -> anyhow::Result<ShutdownReport> {
    let settings = args.settings().context("invalid settings")?;

    // Resolution happens before any socket is opened.
    let app = resolver
        .resolve(&args.app)
        .with_context(|| format!("failed to load application `{}`", args.app))?;
    info!(app = %args.app, "application resolved");

    let server = Server::new(settings, app).context("invalid settings")?;
    let signals = spawn_signal_listener(server.handle());
    let result = server.run().await;
    signals.abort();

    result.context("server failed")
}
