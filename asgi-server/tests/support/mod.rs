#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use asgi_config::{LifespanMode, Settings};
use asgi_server::{
    EventBus, LifecycleState, ServeError, Server, ServerHandle, SessionOutcome,
    SharedApp, ShutdownReport,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(5);

/// Loopback settings on an ephemeral port with short timeouts.
pub fn test_settings() -> Settings {
    Settings {
        host: "127.0.0.1".into(),
        port: 0,
        graceful_timeout: Duration::from_millis(500),
        cancel_timeout: Duration::from_millis(200),
        lifespan: LifespanMode::Off,
        ..Settings::default()
    }
}

#[derive(Debug)]
pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    pub bus: Arc<EventBus>,
    task: JoinHandle<Result<ShutdownReport, ServeError>>,
}

impl TestServer {
    pub async fn start(app: SharedApp) -> Result<Self> {
        Self::start_with(app, test_settings()).await
    }

    pub async fn start_with(app: SharedApp, settings: Settings) -> Result<Self> {
        let server = Server::new(settings, app)?;
        let handle = server.handle();
        let bus = server.event_bus();
        let task = tokio::spawn(server.run());

        let addr = tokio::time::timeout(WAIT, handle.ready())
            .await
            .context("server did not start in time")?
            .ok_or_else(|| anyhow!("server stopped before serving"))?;

        Ok(Self {
            addr,
            handle,
            bus,
            task,
        })
    }

    /// Requests a stop and waits for `run` to return.
    pub async fn stop(self) -> Result<ShutdownReport> {
        self.handle.stop();
        self.join().await
    }

    pub async fn join(self) -> Result<ShutdownReport> {
        let report = tokio::time::timeout(WAIT, self.task)
            .await
            .context("server did not stop in time")??;
        assert_eq!(self.handle.state(), LifecycleState::Stopped);
        Ok(report?)
    }

    /// Polls the event bus until `count` sessions have closed.
    pub async fn closed_sessions(
        &self,
        count: usize,
    ) -> Result<Vec<(Uuid, SessionOutcome)>> {
        wait_for_closed_sessions(&self.bus, count).await
    }
}

pub async fn wait_for_closed_sessions(
    bus: &EventBus,
    count: usize,
) -> Result<Vec<(Uuid, SessionOutcome)>> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let closed = bus.closed_sessions();
        if closed.len() >= count {
            return Ok(closed);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("expected {count} closed sessions, saw {closed:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Writes `request` and reads until the server closes the connection.
///
/// A reset counts as a close; whatever arrived before it is returned.
pub async fn exchange(addr: SocketAddr, request: &[u8]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request).await?;
    read_until_closed(&mut stream).await
}

pub async fn read_until_closed<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut received = Vec::new();
    let mut buf = [0_u8; 8192];
    tokio::time::timeout(WAIT, async {
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
    })
    .await
    .context("connection was not closed in time")?;
    Ok(received)
}

pub fn get(path: &str) -> Vec<u8> {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").into_bytes()
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let split = raw
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .ok_or_else(|| anyhow!("no header terminator in {raw:?}"))?;
        let head = std::str::from_utf8(&raw[..split])?;
        let payload = &raw[split + 4..];

        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let status = status_line
            .split(' ')
            .nth(1)
            .ok_or_else(|| anyhow!("bad status line {status_line:?}"))?
            .parse()?;
        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| {
                (name.trim().to_ascii_lowercase(), value.trim().to_owned())
            })
            .collect::<Vec<_>>();

        let chunked = headers.iter().any(|(name, value)| {
            name == "transfer-encoding" && value.eq_ignore_ascii_case("chunked")
        });
        let body = if chunked {
            decode_chunked(payload)?
        } else {
            payload.to_vec()
        };

        Ok(Self {
            status,
            headers,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header == name)
            .map(|(_, value)| value.as_str())
    }
}

fn decode_chunked(mut payload: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line_end = payload
            .windows(2)
            .position(|window| window == b"\r\n")
            .ok_or_else(|| anyhow!("truncated chunk size line"))?;
        let size_line = std::str::from_utf8(&payload[..line_end])?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16)?;
        payload = &payload[line_end + 2..];
        if size == 0 {
            return Ok(body);
        }
        if payload.len() < size + 2 {
            bail!("truncated chunk");
        }
        body.extend_from_slice(&payload[..size]);
        payload = &payload[size + 2..];
    }
}

/// Number of response status lines in `raw`.
pub fn count_responses(raw: &[u8]) -> usize {
    raw.windows(5).filter(|window| *window == b"HTTP/").count()
}
