//! Outbound half of an HTTP session: the response state machine and the
//! body stream hyper pulls from.

use asgi_model::{HeaderList, ProtocolError, SendEvent, SessionError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::channel::OutboundSink;

/// Body type of every response the engine produces.
pub(crate) type ResponseBody = UnsyncBoxBody<Bytes, ResponseAborted>;

/// The response was cut short; hyper closes the transport without finishing
/// the message.
#[derive(Debug, Error)]
#[error("response aborted")]
pub(crate) struct ResponseAborted;

/// Messages from the response sink to the hyper service.
#[derive(Debug)]
pub(crate) enum Outbound {
    Start { status: StatusCode, headers: HeaderMap },
    Chunk(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    Init,
    Started { body_sent: bool },
    Closed,
}

impl ResponseState {
    fn describe(self) -> &'static str {
        match self {
            ResponseState::Init => "the response is not started",
            ResponseState::Started { .. } => "the response is started",
            ResponseState::Closed => "the response is closed",
        }
    }
}

/// How the response stood when the application returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Settled {
    Complete,
    Disconnected,
    Violation(ProtocolError),
    Aborted,
}

/// Enforces `Init -> Started -> Closed` and feeds accepted events into the
/// bounded outbound queue.
#[derive(Debug)]
pub(crate) struct ResponseSink {
    state: ResponseState,
    tx: Option<mpsc::Sender<Outbound>>,
    abort: CancellationToken,
    violation: Option<ProtocolError>,
    disconnected: bool,
}

impl ResponseSink {
    pub(crate) fn new(
        tx: mpsc::Sender<Outbound>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            state: ResponseState::Init,
            tx: Some(tx),
            abort,
            violation: None,
            disconnected: false,
        }
    }

    /// Settles the response after the application returned.
    ///
    /// A started response without body gets its implicit empty terminal
    /// body; anything short of that is a violation and aborts the transport.
    pub(crate) fn settle(&mut self, returned_ok: bool) -> Settled {
        if let Some(violation) = &self.violation {
            return Settled::Violation(violation.clone());
        }
        match self.state {
            ResponseState::Closed if self.disconnected => Settled::Disconnected,
            ResponseState::Closed => Settled::Complete,
            _ if !returned_ok => {
                self.close();
                self.abort.cancel();
                Settled::Aborted
            }
            ResponseState::Started { body_sent: false } => {
                self.close();
                Settled::Complete
            }
            ResponseState::Started { body_sent: true } => {
                Settled::Violation(self.violate(ProtocolError::IncompleteResponse))
            }
            ResponseState::Init => {
                Settled::Violation(self.violate(ProtocolError::NoResponse))
            }
        }
    }

    /// Records that the transport is gone; further sends fail.
    pub(crate) fn transport_closed(&mut self) {
        if self.state != ResponseState::Closed {
            self.disconnected = true;
            self.close();
        }
    }

    fn close(&mut self) {
        self.state = ResponseState::Closed;
        self.tx = None;
    }

    fn violate(&mut self, err: ProtocolError) -> ProtocolError {
        // A completed response keeps flushing; only an open one is cut.
        if self.state != ResponseState::Closed {
            self.abort.cancel();
        }
        self.close();
        self.violation.get_or_insert_with(|| err.clone());
        err
    }

    async fn push(
        &mut self,
        message: Outbound,
        kind: &str,
    ) -> Result<(), SessionError> {
        let Some(tx) = &self.tx else {
            return Err(ProtocolError::SessionClosed { kind: kind.into() }.into());
        };
        if tx.send(message).await.is_err() {
            self.transport_closed();
            return Err(ProtocolError::SessionClosed { kind: kind.into() }.into());
        }
        Ok(())
    }
}

#[async_trait]
impl OutboundSink for ResponseSink {
    async fn accept(&mut self, event: SendEvent) -> Result<(), SessionError> {
        let kind = event.kind().to_owned();

        if self.state == ResponseState::Closed {
            let err = ProtocolError::SessionClosed { kind };
            if self.disconnected {
                return Err(err.into());
            }
            return Err(self.violate(err).into());
        }

        match (self.state, event) {
            (_, SendEvent::Extension(_)) => {
                Err(self.violate(ProtocolError::UnsupportedEvent { kind }).into())
            }
            (
                ResponseState::Init,
                SendEvent::HttpResponseStart {
                    status,
                    headers,
                    trailers,
                },
            ) => {
                if trailers {
                    return Err(self
                        .violate(ProtocolError::InvalidEvent {
                            kind,
                            reason: "response trailers are not supported".into(),
                        })
                        .into());
                }
                let status = match parse_status(status) {
                    Ok(status) => status,
                    Err(err) => return Err(self.violate(err).into()),
                };
                let headers = match build_headers(headers) {
                    Ok(headers) => headers,
                    Err(err) => return Err(self.violate(err).into()),
                };
                self.push(Outbound::Start { status, headers }, &kind).await?;
                self.state = ResponseState::Started { body_sent: false };
                Ok(())
            }
            (
                ResponseState::Started { .. },
                SendEvent::HttpResponseBody { body, more_body },
            ) => {
                if !body.is_empty() {
                    self.push(Outbound::Chunk(body), &kind).await?;
                }
                if more_body {
                    self.state = ResponseState::Started { body_sent: true };
                } else {
                    self.close();
                }
                Ok(())
            }
            (state, _) => Err(self
                .violate(ProtocolError::UnexpectedEvent {
                    state: state.describe(),
                    kind,
                })
                .into()),
        }
    }
}

fn parse_status(status: u16) -> Result<StatusCode, ProtocolError> {
    // Interim responses cannot stand in for the final one.
    match StatusCode::from_u16(status) {
        Ok(code) if !code.is_informational() => Ok(code),
        _ => Err(ProtocolError::InvalidStatus(status)),
    }
}

fn build_headers(headers: HeaderList) -> Result<HeaderMap, ProtocolError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(&name).map_err(|_| {
            ProtocolError::InvalidHeader(format!(
                "bad header name {:?}",
                String::from_utf8_lossy(&name)
            ))
        })?;
        let header_value = HeaderValue::from_maybe_shared(value).map_err(|_| {
            ProtocolError::InvalidHeader(format!(
                "bad value for header `{header_name}`"
            ))
        })?;
        map.append(header_name, header_value);
    }
    Ok(map)
}

/// Streams queued chunks to hyper until the sink closes the queue.
///
/// Cancelling `abort` turns the next poll into an error so hyper drops the
/// connection instead of completing the message.
pub(crate) fn response_body(
    rx: mpsc::Receiver<Outbound>,
    abort: CancellationToken,
) -> ResponseBody {
    let frames = stream::unfold(Some((rx, abort)), |state| async move {
        let (mut rx, abort) = state?;
        tokio::select! {
            biased;
            _ = abort.cancelled() => Some((Err(ResponseAborted), None)),
            message = rx.recv() => match message {
                Some(Outbound::Chunk(bytes)) => {
                    Some((Ok(Frame::data(bytes)), Some((rx, abort))))
                }
                // The state machine never queues a second start.
                Some(Outbound::Start { .. }) => {
                    Some((Err(ResponseAborted), None))
                }
                None => None,
            },
        }
    });
    StreamBody::new(frames).boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(capacity: usize) -> (ResponseSink, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ResponseSink::new(tx, CancellationToken::new()), rx)
    }

    fn protocol(err: SessionError) -> ProtocolError {
        match err {
            SessionError::Protocol(err) => err,
            SessionError::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn body_before_start_is_rejected() {
        let (mut sink, _rx) = sink(4);

        let err = sink
            .accept(SendEvent::body(&b"early"[..], false))
            .await
            .expect_err("body before start");

        assert!(matches!(
            protocol(err),
            ProtocolError::UnexpectedEvent {
                state: "the response is not started",
                ..
            }
        ));
        assert!(sink.abort.is_cancelled());
    }

    #[tokio::test]
    async fn sends_after_terminal_body_fail() {
        let (mut sink, mut rx) = sink(4);
        sink.accept(SendEvent::start(200, Vec::new())).await.expect("start");
        sink.accept(SendEvent::body(&b"done"[..], false))
            .await
            .expect("terminal body");

        let err = sink
            .accept(SendEvent::body(&b"more"[..], false))
            .await
            .expect_err("second terminal body");
        assert!(matches!(
            protocol(err),
            ProtocolError::SessionClosed { .. }
        ));
        // The completed response is not cut short.
        assert!(!sink.abort.is_cancelled());

        assert!(matches!(rx.recv().await, Some(Outbound::Start { .. })));
        assert!(matches!(rx.recv().await, Some(Outbound::Chunk(_))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn started_response_without_body_is_completed_on_return() {
        let (mut sink, mut rx) = sink(4);
        sink.accept(SendEvent::start(204, Vec::new())).await.expect("start");

        assert_eq!(sink.settle(true), Settled::Complete);
        assert!(matches!(rx.recv().await, Some(Outbound::Start { .. })));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn partial_body_on_return_is_incomplete() {
        let (mut sink, _rx) = sink(4);
        sink.accept(SendEvent::start(200, Vec::new())).await.expect("start");
        sink.accept(SendEvent::body(&b"part"[..], true))
            .await
            .expect("partial body");

        assert_eq!(
            sink.settle(true),
            Settled::Violation(ProtocolError::IncompleteResponse)
        );
        assert!(sink.abort.is_cancelled());
    }

    #[tokio::test]
    async fn invalid_status_and_headers_are_rejected() {
        let (mut sink, _rx) = sink(4);
        let err = sink
            .accept(SendEvent::start(99, Vec::new()))
            .await
            .expect_err("status 99");
        assert_eq!(protocol(err), ProtocolError::InvalidStatus(99));

        let (mut sink, _rx) = self::sink(4);
        let headers =
            vec![(Bytes::from_static(b"bad header"), Bytes::from_static(b"x"))];
        let err = sink
            .accept(SendEvent::start(200, headers))
            .await
            .expect_err("space in header name");
        assert!(matches!(protocol(err), ProtocolError::InvalidHeader(_)));
    }

    #[tokio::test]
    async fn extension_events_are_unsupported() {
        let (mut sink, _rx) = sink(4);
        let event: SendEvent = serde_json::from_value(serde_json::json!({
            "type": "http.response.zerocopysend",
            "file": 3,
        }))
        .expect("extension parses");

        let err = sink.accept(event).await.expect_err("no extensions");
        assert!(matches!(
            protocol(err),
            ProtocolError::UnsupportedEvent { .. }
        ));
    }

    #[tokio::test]
    async fn dropped_transport_closes_the_session() {
        let (mut sink, rx) = sink(1);
        drop(rx);

        let err = sink
            .accept(SendEvent::start(200, Vec::new()))
            .await
            .expect_err("no transport");
        assert!(matches!(
            protocol(err),
            ProtocolError::SessionClosed { .. }
        ));
        assert_eq!(sink.settle(false), Settled::Disconnected);
    }
}
