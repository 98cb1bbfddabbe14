use asgi_config::{ServeArgs, load_env_file};
use asgi_server::{runner, telemetry};
use clap::Parser;
use tracing::info;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "asgi-server")]
#[command(about = "Serve an ASGI application over HTTP/1.1")]
struct Cli {
    #[command(flatten)]
    serve: ServeArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loaded before parsing so `.env` values act as env fallbacks.
    let env_file = load_env_file();
    let cli = Cli::parse();

    telemetry::init_tracing(cli.serve.log_level);
    env_file.log();

    let report = runner::run(cli.serve).await?;
    info!(
        completed = report.completed,
        cancelled = report.cancelled,
        "server stopped"
    );
    Ok(())
}
