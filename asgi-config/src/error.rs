//! Settings validation errors.

use thiserror::Error;

/// Reasons a [`Settings`](crate::Settings) value is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    /// The host is empty or whitespace.
    #[error("host must not be empty")]
    EmptyHost,

    /// A queue bound is zero.
    #[error("{name} must be at least 1")]
    ZeroBuffer {
        /// Setting that was zero.
        name: &'static str,
    },

    /// `max_connections` is set to zero.
    #[error("max_connections must be at least 1 when set")]
    ZeroMaxConnections,
}
