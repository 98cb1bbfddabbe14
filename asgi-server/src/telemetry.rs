use asgi_config::LogLevel;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. `RUST_LOG` replaces the `--log-level`
/// default when set.
pub fn init_tracing(level: LogLevel) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.as_filter())),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
