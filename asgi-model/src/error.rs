use thiserror::Error;

/// Violations of the event protocol, raised either by the peer's framing or
/// by the application's ordering of outbound events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("unsupported HTTP version {0}")]
    UnsupportedHttpVersion(String),

    #[error("event `{kind}` is not allowed while {state}")]
    UnexpectedEvent { state: &'static str, kind: String },

    #[error("event `{kind}` sent after the response was closed")]
    SessionClosed { kind: String },

    #[error("extension event `{kind}` is not supported by this server")]
    UnsupportedEvent { kind: String },

    #[error("invalid status code {0}")]
    InvalidStatus(u16),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("invalid `{kind}` event: {reason}")]
    InvalidEvent { kind: String, reason: String },

    #[error("event is missing its `type` field")]
    MissingEventType,

    #[error("application returned before finishing the response body")]
    IncompleteResponse,

    #[error("application returned without starting a response")]
    NoResponse,
}

impl ProtocolError {
    /// Short stable label for logs and event payloads.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProtocolError::MalformedRequest(_) => "malformed_request",
            ProtocolError::UnsupportedHttpVersion(_) => {
                "unsupported_http_version"
            }
            ProtocolError::UnexpectedEvent { .. } => "unexpected_event",
            ProtocolError::SessionClosed { .. } => "session_closed",
            ProtocolError::UnsupportedEvent { .. } => "unsupported_event",
            ProtocolError::InvalidStatus(_) => "invalid_status",
            ProtocolError::InvalidHeader(_) => "invalid_header",
            ProtocolError::InvalidEvent { .. } => "invalid_event",
            ProtocolError::MissingEventType => "missing_event_type",
            ProtocolError::IncompleteResponse => "incomplete_response",
            ProtocolError::NoResponse => "no_response",
        }
    }
}

/// Error returned to the application from `receive` and `send`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The server is shutting down and the session was cancelled.
    #[error("session cancelled by server shutdown")]
    Cancelled,
}

impl SessionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::Cancelled)
    }
}
