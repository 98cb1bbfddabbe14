use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use asgi_model::{ProtocolError, ReceiveEvent, Scope, SendEvent};
use asgi_server::demos::{Echo, HELLO_BODY, HelloWorld};
use asgi_server::{
    ApplicationError, BindError, EventReceiver, EventSender, LifecycleState,
    ServeError, Server, ServerEvent, SessionOutcome, app_fn,
};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

mod support;
use support::{
    RawResponse, TestServer, count_responses, exchange, get, read_until_closed,
    test_settings,
};

#[tokio::test]
async fn hello_world_answers_with_json_and_closes() -> Result<()> {
    let server = TestServer::start(Arc::new(HelloWorld)).await?;

    let raw = exchange(server.addr, &get("/")).await?;
    let response = RawResponse::parse(&raw)?;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("application/json"));
    assert_eq!(response.body, HELLO_BODY);
    assert_eq!(count_responses(&raw), 1);

    let closed = server.closed_sessions(1).await?;
    assert_eq!(closed[0].1, SessionOutcome::Completed);

    let report = server.stop().await?;
    assert_eq!(report.cancelled, 0);
    Ok(())
}

#[tokio::test]
async fn echo_streams_the_request_body_back() -> Result<()> {
    let server = TestServer::start(Arc::new(Echo)).await?;

    let request = b"POST /echo HTTP/1.1\r\n\
        Host: localhost\r\n\
        Content-Type: text/plain\r\n\
        Transfer-Encoding: chunked\r\n\
        \r\n\
        6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n";
    let raw = exchange(server.addr, request).await?;
    let response = RawResponse::parse(&raw)?;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.body, b"hello world");

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn application_error_after_start_closes_without_second_response()
-> Result<()> {
    let app = app_fn(|_scope, _receive, send: EventSender| async move {
        send.send(SendEvent::start(200, Vec::new())).await?;
        Err::<(), ApplicationError>(anyhow::anyhow!("handler blew up"))
    });
    let server = TestServer::start(Arc::new(app)).await?;

    let raw = exchange(server.addr, &get("/fails")).await?;
    assert!(count_responses(&raw) <= 1, "got {raw:?}");

    let closed = server.closed_sessions(1).await?;
    // Give a second report a chance to show up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let closed_now = server.bus.closed_sessions();
    assert_eq!(closed_now.len(), 1);
    match &closed[0].1 {
        SessionOutcome::ApplicationError(message) => {
            assert!(message.contains("handler blew up"));
        }
        other => panic!("expected application error, got {other:?}"),
    }

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn returning_without_response_is_a_protocol_violation() -> Result<()> {
    let app = app_fn(|_scope, _receive, _send| async {
        Ok::<_, ApplicationError>(())
    });
    let server = TestServer::start(Arc::new(app)).await?;

    let raw = exchange(server.addr, &get("/")).await?;
    assert_eq!(count_responses(&raw), 0);

    let closed = server.closed_sessions(1).await?;
    assert_eq!(
        closed[0].1,
        SessionOutcome::ProtocolViolation(ProtocolError::NoResponse)
    );

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn malformed_request_never_reaches_the_application() -> Result<()> {
    let invoked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&invoked);
    let app = app_fn(move |_scope, _receive, _send| {
        flag.store(true, Ordering::SeqCst);
        async { Ok::<_, ApplicationError>(()) }
    });
    let server = TestServer::start(Arc::new(app)).await?;

    exchange(server.addr, b"NOT AN HTTP REQUEST\r\n\r\n").await?;

    let closed = server.closed_sessions(1).await?;
    assert!(matches!(
        closed[0].1,
        SessionOutcome::MalformedRequest(_)
    ));
    assert!(!invoked.load(Ordering::SeqCst));

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn disconnect_follows_the_request_body() -> Result<()> {
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let app = app_fn(move |_scope, receive: EventReceiver, send: EventSender| {
        let seen = seen_tx.clone();
        async move {
            let first = receive.receive().await?;
            send.send(SendEvent::start(204, Vec::new())).await?;
            send.send(SendEvent::body(Bytes::new(), false)).await?;
            let second = receive.receive().await?;
            let _ = seen.send((first, second));
            Ok::<_, ApplicationError>(())
        }
    });
    let server = TestServer::start(Arc::new(app)).await?;

    let raw = exchange(server.addr, &get("/")).await?;
    assert_eq!(RawResponse::parse(&raw)?.status, 204);

    let (first, second) = tokio::time::timeout(support::WAIT, seen_rx.recv())
        .await?
        .expect("application reported its events");
    assert_eq!(first, ReceiveEvent::request(Bytes::new(), false));
    assert_eq!(second, ReceiveEvent::HttpDisconnect);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_sessions_stream_in_order() -> Result<()> {
    const CLIENTS: usize = 16;
    const CHUNKS: usize = 20;

    let app = app_fn(|_scope, _receive, send: EventSender| async move {
        send.send(SendEvent::start(200, Vec::new())).await?;
        for i in 0..CHUNKS {
            let more = i + 1 < CHUNKS;
            send.send(SendEvent::body(format!("{i}\n").into_bytes(), more))
                .await?;
            if i % 4 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
        Ok::<_, ApplicationError>(())
    });
    let server = TestServer::start(Arc::new(app)).await?;
    let expected = (0..CHUNKS).map(|i| format!("{i}\n")).collect::<String>();

    let clients = (0..CLIENTS)
        .map(|n| {
            let addr = server.addr;
            tokio::spawn(async move { exchange(addr, &get(&format!("/{n}"))).await })
        })
        .collect::<Vec<_>>();
    for client in clients {
        let raw = client.await??;
        let response = RawResponse::parse(&raw)?;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, expected.as_bytes());
        assert_eq!(count_responses(&raw), 1);
    }

    let closed = server.closed_sessions(CLIENTS).await?;
    assert_eq!(closed.len(), CLIENTS);
    assert!(
        closed
            .iter()
            .all(|(_, outcome)| *outcome == SessionOutcome::Completed)
    );

    let report = server.stop().await?;
    assert_eq!(report.cancelled, 0);
    Ok(())
}

#[tokio::test]
async fn stop_during_streaming_drains_and_stops() -> Result<()> {
    let streaming = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&streaming);
    let app = app_fn(move |_scope, _receive, send: EventSender| {
        let flag = Arc::clone(&flag);
        async move {
            send.send(SendEvent::start(200, Vec::new())).await?;
            for _ in 0_u64.. {
                send.send(SendEvent::body(&b"tick\n"[..], true)).await?;
                flag.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Ok::<_, ApplicationError>(())
        }
    });
    let server = TestServer::start(Arc::new(app)).await?;
    let addr = server.addr;

    let mut client = TcpStream::connect(addr).await?;
    client.write_all(&get("/stream")).await?;
    let reader = tokio::spawn(async move { read_until_closed(&mut client).await });
    while !streaming.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    server.handle.stop();
    assert!(
        server.handle.wait_for_state(LifecycleState::Draining).await
            >= LifecycleState::Draining
    );

    let bus = Arc::clone(&server.bus);
    let report = server.join().await?;
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.completed, 0);

    let received = reader.await??;
    assert_eq!(count_responses(&received), 1);
    assert!(matches!(
        bus.closed_sessions().as_slice(),
        [(_, SessionOutcome::Cancelled)]
    ));

    // The listener is gone once the server stopped.
    assert!(TcpStream::connect(addr).await.is_err());
    Ok(())
}

#[tokio::test]
async fn repeated_stop_requests_are_harmless() -> Result<()> {
    let server = TestServer::start(Arc::new(HelloWorld)).await?;

    server.handle.stop();
    server.handle.stop();
    let handle = server.handle.clone();
    let bus = Arc::clone(&server.bus);
    let report = server.join().await?;
    handle.stop();

    assert_eq!(report, Default::default());
    assert_eq!(handle.state(), LifecycleState::Stopped);
    assert_eq!(
        bus.transitions(),
        [
            LifecycleState::Starting,
            LifecycleState::Running,
            LifecycleState::Draining,
            LifecycleState::Stopped,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn binding_a_busy_port_fails_before_serving() -> Result<()> {
    let holder = TestServer::start(Arc::new(HelloWorld)).await?;

    let settings = asgi_config::Settings {
        port: holder.addr.port(),
        ..test_settings()
    };
    let server = Server::new(settings, Arc::new(HelloWorld))?;
    let handle = server.handle();

    let err = server.run().await.expect_err("port is taken");
    assert!(matches!(err, ServeError::Bind(BindError::Io { .. })));
    assert_eq!(handle.state(), LifecycleState::Stopped);
    assert_eq!(handle.ready().await, None);

    holder.stop().await?;
    Ok(())
}

#[tokio::test]
async fn connections_over_the_limit_are_refused() -> Result<()> {
    let release = Arc::new(tokio::sync::Notify::new());
    let gate = Arc::clone(&release);
    let app = app_fn(move |_scope, _receive, send: EventSender| {
        let gate = Arc::clone(&gate);
        async move {
            gate.notified().await;
            send.send(SendEvent::start(204, Vec::new())).await?;
            Ok::<_, ApplicationError>(())
        }
    });
    let settings = asgi_config::Settings {
        max_connections: Some(1),
        ..test_settings()
    };
    let server = TestServer::start_with(Arc::new(app), settings).await?;

    let mut events = server.bus.subscribe();
    let mut first = TcpStream::connect(server.addr).await?;
    first.write_all(&get("/slow")).await?;
    tokio::time::timeout(support::WAIT, async {
        while let Ok(event) = events.recv().await {
            if matches!(event, ServerEvent::SessionOpened { .. }) {
                break;
            }
        }
    })
    .await?;

    let mut second = TcpStream::connect(server.addr).await?;
    // The server may drop the socket before the write lands.
    let _ = second.write_all(&get("/refused")).await;
    assert!(read_until_closed(&mut second).await?.is_empty());
    assert_eq!(server.bus.refused_connections(), 1);

    release.notify_one();
    let raw = read_until_closed(&mut first).await?;
    assert_eq!(RawResponse::parse(&raw)?.status, 204);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn http_scope_reflects_the_request() -> Result<()> {
    let (scope_tx, mut scope_rx) = tokio::sync::mpsc::unbounded_channel();
    let app = app_fn(move |scope: Scope, _receive, send: EventSender| {
        let scope_tx = scope_tx.clone();
        async move {
            let _ = scope_tx.send(scope);
            send.send(SendEvent::start(204, Vec::new())).await?;
            Ok::<_, ApplicationError>(())
        }
    });
    let settings = asgi_config::Settings {
        root_path: "/api".into(),
        ..test_settings()
    };
    let server = TestServer::start_with(Arc::new(app), settings).await?;

    let request = b"GET /caf%C3%A9/menu?lang=fr HTTP/1.1\r\n\
        Host: localhost\r\nX-Trace: abc\r\n\r\n";
    let _ = exchange(server.addr, request).await?;

    let scope = tokio::time::timeout(support::WAIT, scope_rx.recv())
        .await?
        .expect("scope delivered");
    let scope = scope.as_http().expect("http scope");
    assert_eq!(scope.method(), "GET");
    assert_eq!(scope.path(), "/café/menu");
    assert_eq!(scope.raw_path(), b"/caf%C3%A9/menu");
    assert_eq!(scope.query_string(), b"lang=fr");
    assert_eq!(scope.root_path(), "/api");
    assert_eq!(scope.header("x-trace"), Some(&b"abc"[..]));
    assert_eq!(
        scope.client().map(|addr| addr.ip().to_string()).as_deref(),
        Some("127.0.0.1")
    );
    assert_eq!(scope.server(), Some(server.addr));

    server.stop().await?;
    Ok(())
}
