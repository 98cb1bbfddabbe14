//! Connection scopes handed to the application at invocation start.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use http::request::Parts;
use percent_encoding::percent_decode_str;
use serde::{Serialize, Serializer};

use crate::error::ProtocolError;
use crate::event::HeaderList;

/// Protocol version advertised in every scope.
pub const ASGI_VERSION: &str = "3.0";
/// HTTP sub-specification version advertised in HTTP scopes.
pub const HTTP_SPEC_VERSION: &str = "2.3";

/// The `asgi` sub-dictionary of a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AsgiInfo {
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_version: Option<&'static str>,
}

impl AsgiInfo {
    fn http() -> Self {
        Self {
            version: ASGI_VERSION,
            spec_version: Some(HTTP_SPEC_VERSION),
        }
    }

    fn lifespan() -> Self {
        Self {
            version: ASGI_VERSION,
            spec_version: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
    Http2,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "1.0",
            HttpVersion::Http11 => "1.1",
            HttpVersion::Http2 => "2",
        }
    }
}

impl TryFrom<http::Version> for HttpVersion {
    type Error = ProtocolError;

    fn try_from(version: http::Version) -> Result<Self, Self::Error> {
        match version {
            http::Version::HTTP_10 => Ok(HttpVersion::Http10),
            http::Version::HTTP_11 => Ok(HttpVersion::Http11),
            http::Version::HTTP_2 => Ok(HttpVersion::Http2),
            other => {
                Err(ProtocolError::UnsupportedHttpVersion(format!("{other:?}")))
            }
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for HttpVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Scope of a single HTTP request/response exchange.
///
/// Built once per connection from the parsed request head and never mutated
/// afterwards; all fields are read through accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpScope {
    asgi: AsgiInfo,
    http_version: HttpVersion,
    method: String,
    scheme: &'static str,
    path: String,
    raw_path: Bytes,
    query_string: Bytes,
    root_path: String,
    headers: HeaderList,
    #[serde(serialize_with = "serialize_addr")]
    client: Option<SocketAddr>,
    #[serde(serialize_with = "serialize_addr")]
    server: Option<SocketAddr>,
}

impl HttpScope {
    /// Builds the scope from a parsed request head.
    ///
    /// Fails when the HTTP version is not one the protocol names or when the
    /// percent-decoded path is not valid UTF-8.
    pub fn from_request_parts(
        parts: &Parts,
        client: Option<SocketAddr>,
        server: Option<SocketAddr>,
        root_path: &str,
    ) -> Result<Self, ProtocolError> {
        let http_version = HttpVersion::try_from(parts.version)?;

        let raw_path = parts.uri.path();
        let path = percent_decode_str(raw_path)
            .decode_utf8()
            .map_err(|err| {
                ProtocolError::MalformedRequest(format!(
                    "path is not valid UTF-8 once decoded: {err}"
                ))
            })?
            .into_owned();
        let query_string = parts.uri.query().unwrap_or_default();

        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                // `HeaderName` is always stored lowercase.
                (
                    Bytes::copy_from_slice(name.as_str().as_bytes()),
                    Bytes::copy_from_slice(value.as_bytes()),
                )
            })
            .collect();

        Ok(Self {
            asgi: AsgiInfo::http(),
            http_version,
            method: parts.method.as_str().to_ascii_uppercase(),
            scheme: "http",
            path,
            raw_path: Bytes::copy_from_slice(raw_path.as_bytes()),
            query_string: Bytes::copy_from_slice(query_string.as_bytes()),
            root_path: root_path.to_owned(),
            headers,
            client,
            server,
        })
    }

    pub fn asgi(&self) -> &AsgiInfo {
        &self.asgi
    }

    pub fn http_version(&self) -> HttpVersion {
        self.http_version
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn scheme(&self) -> &str {
        self.scheme
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn raw_path(&self) -> &[u8] {
        &self.raw_path
    }

    pub fn query_string(&self) -> &[u8] {
        &self.query_string
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn headers(&self) -> &[(Bytes, Bytes)] {
        &self.headers
    }

    /// First value of the named header; `name` must be lowercase.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key.as_ref() == name.as_bytes())
            .map(|(_, value)| value.as_ref())
    }

    pub fn client(&self) -> Option<SocketAddr> {
        self.client
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    /// Request target as it appears in an access log line.
    pub fn target(&self) -> String {
        if self.query_string.is_empty() {
            self.path.clone()
        } else {
            format!(
                "{}?{}",
                self.path,
                String::from_utf8_lossy(&self.query_string)
            )
        }
    }
}

/// Scope of the application-wide startup/shutdown conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifespanScope {
    asgi: AsgiInfo,
}

impl LifespanScope {
    pub fn new() -> Self {
        Self {
            asgi: AsgiInfo::lifespan(),
        }
    }

    pub fn asgi(&self) -> &AsgiInfo {
        &self.asgi
    }
}

impl Default for LifespanScope {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Scope {
    Http(HttpScope),
    Lifespan(LifespanScope),
}

impl Scope {
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Http(_) => "http",
            Scope::Lifespan(_) => "lifespan",
        }
    }

    pub fn as_http(&self) -> Option<&HttpScope> {
        match self {
            Scope::Http(scope) => Some(scope),
            Scope::Lifespan(_) => None,
        }
    }
}

fn serialize_addr<S: Serializer>(
    addr: &Option<SocketAddr>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match addr {
        Some(addr) => {
            (addr.ip().to_string(), addr.port()).serialize(serializer)
        }
        None => serializer.serialize_none(),
    }
}
