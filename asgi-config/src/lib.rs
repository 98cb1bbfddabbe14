//! Configuration for the asgi-server workspace.
//!
//! [`Settings`] is assembled once from CLI flags, `ASGI_*` environment
//! variables (optionally loaded from a `.env` file) and defaults, validated,
//! and then shared read-only for the lifetime of the server.

pub mod cli;
pub mod env;
pub mod error;
pub mod settings;

pub use cli::ServeArgs;
pub use env::{EnvFileLoad, load_env_file};
pub use error::SettingsError;
pub use settings::{LifespanMode, LogLevel, Settings};
