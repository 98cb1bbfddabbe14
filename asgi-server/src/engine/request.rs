//! Inbound half of an HTTP session.

use asgi_model::ReceiveEvent;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Feeds the request body into the inbound queue as `http.request` chunks,
/// then queues a single `http.disconnect` once the transport is done.
///
/// Returns early when the application stops listening.
pub(crate) async fn pump_request(
    mut body: Incoming,
    tx: mpsc::Sender<ReceiveEvent>,
    transport_closed: CancellationToken,
) {
    let mut terminal_sent = false;

    loop {
        let frame = tokio::select! {
            biased;
            _ = transport_closed.cancelled() => break,
            frame = body.frame() => frame,
        };

        match frame {
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    // Request trailers are not part of the event stream.
                    continue;
                };
                let more_body = !body.is_end_stream();
                if data.is_empty() && more_body {
                    continue;
                }
                terminal_sent = !more_body;
                if tx.send(ReceiveEvent::request(data, more_body)).await.is_err() {
                    return;
                }
            }
            Some(Err(err)) => {
                tracing::debug!(error = %err, "request body interrupted");
                let _ = tx.send(ReceiveEvent::HttpDisconnect).await;
                return;
            }
            None => {
                if !terminal_sent {
                    let last = ReceiveEvent::request(Bytes::new(), false);
                    if tx.send(last).await.is_err() {
                        return;
                    }
                }
                transport_closed.cancelled().await;
                break;
            }
        }
    }

    let _ = tx.send(ReceiveEvent::HttpDisconnect).await;
}
