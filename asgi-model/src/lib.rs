//! Protocol vocabulary shared across the asgi-server crates.
//!
//! The types here describe what flows between the engine and an
//! application: the immutable [`Scope`] handed over at invocation start and
//! the tagged events exchanged through `receive` and `send`. Field names and
//! `type` tags match the ASGI 3.0 dictionaries exactly, so anything
//! serialized from these types is readable by ASGI tooling.
#![allow(missing_docs)]

pub mod error;
pub mod event;
pub mod scope;

pub use error::{ProtocolError, SessionError};
pub use event::{ExtensionEvent, HeaderList, ReceiveEvent, SendEvent};
pub use scope::{
    ASGI_VERSION, AsgiInfo, HTTP_SPEC_VERSION, HttpScope, HttpVersion,
    LifespanScope, Scope,
};
