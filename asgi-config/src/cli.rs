//! Command-line arguments of the `serve` entry point.

use std::time::Duration;

use clap::Args as ClapArgs;

use crate::error::SettingsError;
use crate::settings::{
    DEFAULT_HOST, DEFAULT_PORT, LifespanMode, LogLevel, Settings,
};

/// Arguments of the `serve` entry point.
///
/// Every flag falls back to an `ASGI_*` environment variable and then to its
/// default.
#[derive(ClapArgs, Debug, Clone)]
pub struct ServeArgs {
    /// Application reference in `module:attribute` form
    #[arg(value_name = "APP", env = "ASGI_APP")]
    pub app: String,

    /// Interface to bind
    #[arg(long, env = "ASGI_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to bind
    #[arg(
        long,
        env = "ASGI_PORT",
        default_value_t = DEFAULT_PORT,
        value_parser = clap::value_parser!(u16).range(1..),
    )]
    pub port: u16,

    /// Minimum log level (RUST_LOG overrides when set)
    #[arg(
        long,
        env = "ASGI_LOG_LEVEL",
        value_enum,
        ignore_case = true,
        default_value_t = LogLevel::Info,
    )]
    pub log_level: LogLevel,

    /// Lifespan protocol handling
    #[arg(
        long,
        env = "ASGI_LIFESPAN",
        value_enum,
        ignore_case = true,
        default_value_t = LifespanMode::Auto,
    )]
    pub lifespan: LifespanMode,

    /// Time in-flight sessions get to finish after a stop request
    #[arg(
        long,
        env = "ASGI_GRACEFUL_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration,
    )]
    pub graceful_timeout: Duration,

    /// Time a cancelled application gets before it is aborted
    #[arg(
        long,
        env = "ASGI_CANCEL_TIMEOUT",
        default_value = "1s",
        value_parser = humantime::parse_duration,
    )]
    pub cancel_timeout: Duration,

    /// Outbound events queued per session before `send` waits
    #[arg(
        long,
        env = "ASGI_OUTBOUND_BUFFER",
        default_value_t = 16,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub outbound_buffer: u64,

    /// Inbound events queued per session before reading pauses
    #[arg(
        long,
        env = "ASGI_INBOUND_BUFFER",
        default_value_t = 16,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub inbound_buffer: u64,

    /// Refuse connections while this many sessions are open
    #[arg(long, env = "ASGI_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,

    /// Mount point reported to the application as `root_path`
    #[arg(long, env = "ASGI_ROOT_PATH", default_value = "")]
    pub root_path: String,
}

impl ServeArgs {
    /// Validated settings for these arguments.
    pub fn settings(&self) -> Result<Settings, SettingsError> {
        let settings = Settings {
            host: self.host.clone(),
            port: self.port,
            log_level: self.log_level,
            outbound_buffer: usize::try_from(self.outbound_buffer)
                .unwrap_or(usize::MAX),
            inbound_buffer: usize::try_from(self.inbound_buffer)
                .unwrap_or(usize::MAX),
            graceful_timeout: self.graceful_timeout,
            cancel_timeout: self.cancel_timeout,
            max_connections: self.max_connections,
            lifespan: self.lifespan,
            root_path: self.root_path.trim_end_matches('/').to_owned(),
        };
        settings.validate()?;
        Ok(settings)
    }
}
