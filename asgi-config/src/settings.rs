//! Server settings and their defaults.

use std::fmt;
use std::time::Duration;

use clap::ValueEnum;

use crate::error::SettingsError;

/// Host bound when none is given.
pub const DEFAULT_HOST: &str = "localhost";
/// Port bound when none is given.
pub const DEFAULT_PORT: u16 = 5000;
/// Default bound on queued outbound events per session.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 16;
/// Default bound on queued inbound events per session.
pub const DEFAULT_INBOUND_BUFFER: usize = 16;
/// Default drain grace period.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);
/// Default time a cancelled application gets before it is aborted.
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(1);

/// Minimum severity of emitted log records.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    ValueEnum,
)]
pub enum LogLevel {
    /// Everything, including per-session detail.
    #[value(name = "DEBUG")]
    Debug,
    /// Lifecycle changes and the access log.
    #[default]
    #[value(name = "INFO")]
    Info,
    /// Protocol violations and recoverable failures.
    #[value(name = "WARN")]
    Warn,
    /// Application and startup failures only.
    #[value(name = "ERROR")]
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Whether the lifespan conversation is run around serving.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    ValueEnum,
)]
pub enum LifespanMode {
    /// Run it, but tolerate applications that do not implement it.
    #[default]
    Auto,
    /// Run it and treat every failure as fatal.
    On,
    /// Never run it.
    Off,
}

impl fmt::Display for LifespanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifespanMode::Auto => "auto",
            LifespanMode::On => "on",
            LifespanMode::Off => "off",
        })
    }
}

/// Server configuration, fixed before the server starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Interface to bind; `localhost` means IPv4 loopback.
    pub host: String,
    /// Port 0 binds an ephemeral port.
    pub port: u16,
    /// Base log filter, replaced by `RUST_LOG` when that is set.
    pub log_level: LogLevel,
    /// Queued, unflushed outbound events per session before `send` waits.
    pub outbound_buffer: usize,
    /// Queued inbound events per session before the request reader waits.
    pub inbound_buffer: usize,
    /// Time in-flight sessions get to finish after a stop request.
    pub graceful_timeout: Duration,
    /// Time a cancelled application gets before its invocation is aborted.
    pub cancel_timeout: Duration,
    /// Connections beyond this many live sessions are refused.
    pub max_connections: Option<usize>,
    /// How the lifespan conversation is handled.
    pub lifespan: LifespanMode,
    /// Mount point copied into every HTTP scope.
    pub root_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            log_level: LogLevel::default(),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            inbound_buffer: DEFAULT_INBOUND_BUFFER,
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
            max_connections: None,
            lifespan: LifespanMode::default(),
            root_path: String::new(),
        }
    }
}

impl Settings {
    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.host.trim().is_empty() {
            return Err(SettingsError::EmptyHost);
        }
        if self.outbound_buffer == 0 {
            return Err(SettingsError::ZeroBuffer {
                name: "outbound_buffer",
            });
        }
        if self.inbound_buffer == 0 {
            return Err(SettingsError::ZeroBuffer {
                name: "inbound_buffer",
            });
        }
        if self.max_connections == Some(0) {
            return Err(SettingsError::ZeroMaxConnections);
        }
        Ok(())
    }

    /// Host to hand to the socket layer; `localhost` binds IPv4 loopback.
    pub fn bind_host(&self) -> &str {
        let host = self.host.trim();
        if host.eq_ignore_ascii_case("localhost") {
            "127.0.0.1"
        } else {
            host
        }
    }

    /// `host:port` form of the bind target, bracketing IPv6 literals.
    pub fn bind_target(&self) -> String {
        let host = self.bind_host();
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{}", self.port)
        } else {
            format!("{host}:{}", self.port)
        }
    }
}
