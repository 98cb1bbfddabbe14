//! `.env` loading.

use std::path::PathBuf;

/// Outcome of looking for a `.env` file next to the working directory.
#[derive(Debug)]
pub enum EnvFileLoad {
    /// Variables were read from this file.
    Loaded(PathBuf),
    /// No `.env` file exists; nothing to do.
    NotFound,
    /// A file exists but could not be read or parsed.
    Failed(dotenvy::Error),
}

/// Loads `.env` into the process environment without overriding variables
/// that are already set, so real environment values keep precedence.
///
/// Must run before the CLI is parsed for `ASGI_*` fallbacks to see it.
pub fn load_env_file() -> EnvFileLoad {
    match dotenvy::dotenv() {
        Ok(path) => EnvFileLoad::Loaded(path),
        Err(err) if err.not_found() => EnvFileLoad::NotFound,
        Err(err) => EnvFileLoad::Failed(err),
    }
}

impl EnvFileLoad {
    /// Reports the outcome once a subscriber is installed.
    pub fn log(&self) {
        match self {
            EnvFileLoad::Loaded(path) => {
                tracing::info!(path = %path.display(), "loaded .env file");
            }
            EnvFileLoad::NotFound => {}
            EnvFileLoad::Failed(err) => {
                tracing::warn!(error = %err, "failed to read .env file");
            }
        }
    }
}
