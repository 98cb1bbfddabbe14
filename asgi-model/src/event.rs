//! Events exchanged between the engine and an application.
//!
//! Both directions are closed variant types tagged on `"type"`. Outbound
//! events additionally carry an [`SendEvent::Extension`] catch-all so that
//! events introduced by later protocol revisions still deserialize; the HTTP
//! engine rejects them unless it advertised the extension.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Ordered `(name, value)` header pairs, raw bytes, names lowercased.
pub type HeaderList = Vec<(Bytes, Bytes)>;

/// Events delivered to the application by `receive`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReceiveEvent {
    #[serde(rename = "http.request")]
    HttpRequest {
        #[serde(default)]
        body: Bytes,
        #[serde(default)]
        more_body: bool,
    },
    #[serde(rename = "http.disconnect")]
    HttpDisconnect,
    #[serde(rename = "lifespan.startup")]
    LifespanStartup,
    #[serde(rename = "lifespan.shutdown")]
    LifespanShutdown,
}

impl ReceiveEvent {
    pub fn request(body: impl Into<Bytes>, more_body: bool) -> Self {
        ReceiveEvent::HttpRequest {
            body: body.into(),
            more_body,
        }
    }

    /// The `type` tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            ReceiveEvent::HttpRequest { .. } => "http.request",
            ReceiveEvent::HttpDisconnect => "http.disconnect",
            ReceiveEvent::LifespanStartup => "lifespan.startup",
            ReceiveEvent::LifespanShutdown => "lifespan.shutdown",
        }
    }
}

/// Events the application hands to `send`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum SendEvent {
    HttpResponseStart {
        status: u16,
        headers: HeaderList,
        trailers: bool,
    },
    HttpResponseBody {
        body: Bytes,
        more_body: bool,
    },
    LifespanStartupComplete,
    LifespanStartupFailed {
        message: String,
    },
    LifespanShutdownComplete,
    LifespanShutdownFailed {
        message: String,
    },
    Extension(ExtensionEvent),
}

/// An outbound event whose tag this version does not know about.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionEvent {
    pub kind: String,
    pub fields: Map<String, Value>,
}

impl SendEvent {
    pub fn start(status: u16, headers: HeaderList) -> Self {
        SendEvent::HttpResponseStart {
            status,
            headers,
            trailers: false,
        }
    }

    pub fn body(body: impl Into<Bytes>, more_body: bool) -> Self {
        SendEvent::HttpResponseBody {
            body: body.into(),
            more_body,
        }
    }

    /// The `type` tag of this event.
    pub fn kind(&self) -> &str {
        match self {
            SendEvent::HttpResponseStart { .. } => "http.response.start",
            SendEvent::HttpResponseBody { .. } => "http.response.body",
            SendEvent::LifespanStartupComplete => "lifespan.startup.complete",
            SendEvent::LifespanStartupFailed { .. } => "lifespan.startup.failed",
            SendEvent::LifespanShutdownComplete => {
                "lifespan.shutdown.complete"
            }
            SendEvent::LifespanShutdownFailed { .. } => {
                "lifespan.shutdown.failed"
            }
            SendEvent::Extension(ext) => &ext.kind,
        }
    }

    /// True for a body event with `more_body = false`.
    pub fn is_terminal_body(&self) -> bool {
        matches!(
            self,
            SendEvent::HttpResponseBody {
                more_body: false,
                ..
            }
        )
    }
}

// Serde representation of the tags this version understands.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum KnownSendEvent {
    #[serde(rename = "http.response.start")]
    HttpResponseStart {
        status: u16,
        #[serde(default)]
        headers: HeaderList,
        #[serde(default)]
        trailers: bool,
    },
    #[serde(rename = "http.response.body")]
    HttpResponseBody {
        #[serde(default)]
        body: Bytes,
        #[serde(default)]
        more_body: bool,
    },
    #[serde(rename = "lifespan.startup.complete")]
    LifespanStartupComplete,
    #[serde(rename = "lifespan.startup.failed")]
    LifespanStartupFailed {
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "lifespan.shutdown.complete")]
    LifespanShutdownComplete,
    #[serde(rename = "lifespan.shutdown.failed")]
    LifespanShutdownFailed {
        #[serde(default)]
        message: String,
    },
}

const KNOWN_SEND_TYPES: &[&str] = &[
    "http.response.start",
    "http.response.body",
    "lifespan.startup.complete",
    "lifespan.startup.failed",
    "lifespan.shutdown.complete",
    "lifespan.shutdown.failed",
];

impl TryFrom<Value> for SendEvent {
    type Error = ProtocolError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::MissingEventType);
        };
        let kind = match fields.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingEventType),
        };

        if !KNOWN_SEND_TYPES.contains(&kind.as_str()) {
            fields.remove("type");
            return Ok(SendEvent::Extension(ExtensionEvent { kind, fields }));
        }

        let known: KnownSendEvent =
            serde_json::from_value(Value::Object(fields)).map_err(|err| {
                ProtocolError::InvalidEvent {
                    kind: kind.clone(),
                    reason: err.to_string(),
                }
            })?;

        Ok(match known {
            KnownSendEvent::HttpResponseStart {
                status,
                headers,
                trailers,
            } => SendEvent::HttpResponseStart {
                status,
                headers,
                trailers,
            },
            KnownSendEvent::HttpResponseBody { body, more_body } => {
                SendEvent::HttpResponseBody { body, more_body }
            }
            KnownSendEvent::LifespanStartupComplete => {
                SendEvent::LifespanStartupComplete
            }
            KnownSendEvent::LifespanStartupFailed { message } => {
                SendEvent::LifespanStartupFailed { message }
            }
            KnownSendEvent::LifespanShutdownComplete => {
                SendEvent::LifespanShutdownComplete
            }
            KnownSendEvent::LifespanShutdownFailed { message } => {
                SendEvent::LifespanShutdownFailed { message }
            }
        })
    }
}

impl From<SendEvent> for Value {
    fn from(event: SendEvent) -> Self {
        let known = match event {
            SendEvent::Extension(ExtensionEvent { kind, mut fields }) => {
                fields.insert("type".into(), Value::String(kind));
                return Value::Object(fields);
            }
            SendEvent::HttpResponseStart {
                status,
                headers,
                trailers,
            } => KnownSendEvent::HttpResponseStart {
                status,
                headers,
                trailers,
            },
            SendEvent::HttpResponseBody { body, more_body } => {
                KnownSendEvent::HttpResponseBody { body, more_body }
            }
            SendEvent::LifespanStartupComplete => {
                KnownSendEvent::LifespanStartupComplete
            }
            SendEvent::LifespanStartupFailed { message } => {
                KnownSendEvent::LifespanStartupFailed { message }
            }
            SendEvent::LifespanShutdownComplete => {
                KnownSendEvent::LifespanShutdownComplete
            }
            SendEvent::LifespanShutdownFailed { message } => {
                KnownSendEvent::LifespanShutdownFailed { message }
            }
        };

        // Plain enums of owned data always serialize into a JSON object.
        serde_json::to_value(known).unwrap_or(Value::Null)
    }
}
