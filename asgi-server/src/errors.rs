use std::io;

use thiserror::Error;

/// Failure to turn a `module:attribute` reference into an application.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("application reference `{0}` must be in `module:attribute` form")]
    MissingSeparator(String),

    #[error("application reference `{0}` has an empty module or attribute")]
    EmptyComponent(String),

    #[error("module `{0}` is not registered")]
    ModuleNotFound(String),

    #[error("module `{module}` failed to initialize: {reason}")]
    ModuleInit { module: String, reason: String },

    #[error("module `{module}` has no attribute `{attribute}`")]
    AttributeNotFound { module: String, attribute: String },

    #[error("`{module}:{attribute}` is not an application")]
    NotAnApplication { module: String, attribute: String },
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to bind {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: io::Error,
    },
}

/// Failures of the lifespan conversation that stop the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifespanError {
    #[error("application reported startup failure: {0}")]
    StartupFailed(String),

    #[error("application reported shutdown failure: {0}")]
    ShutdownFailed(String),

    #[error("lifespan is required but the application did not complete it: {0}")]
    Unsupported(String),

    #[error("lifespan shutdown did not complete in time")]
    ShutdownTimedOut,

    #[error("lifespan startup interrupted by a stop request")]
    Interrupted,
}

/// Reasons [`Server::run`](crate::Server::run) ends without serving.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Lifespan(#[from] LifespanError),
}
