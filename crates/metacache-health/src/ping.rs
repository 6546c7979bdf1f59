//! HTTP ping of a node's RPC address.
//!
//! The RPC listener is not a health endpoint: any HTTP answer, whatever its
//! status, proves the process is up. Only a failed exchange or silence past
//! the timeout counts as dead.

use std::time::Duration;

use bytes::Bytes;
use http::header::{HOST, USER_AGENT};
use http::{Request, StatusCode};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;

/// Why a ping got no answer.
#[derive(Debug, Error)]
pub enum PingError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("http exchange failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("no answer within {0:?}")]
    Timeout(Duration),
}

/// GET `path` on `address` (ip:port) and return the status it answered with.
pub async fn ping(address: &str, path: &str, timeout: Duration) -> Result<StatusCode, PingError> {
    tokio::time::timeout(timeout, exchange(address, path))
        .await
        .map_err(|_| PingError::Timeout(timeout))?
}

async fn exchange(address: &str, path: &str) -> Result<StatusCode, PingError> {
    let stream = TcpStream::connect(address).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = Request::get(format!("http://{address}{path}"))
        .header(HOST, address)
        .header(USER_AGENT, "metacache-health/0.1")
        .body(Empty::<Bytes>::new())?;
    let resp = sender.send_request(req).await?;
    Ok(resp.status())
}

/// Parse a duration like `"500ms"`, `"5s"`, `"2m"` or `"1h"`. A bare
/// number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().ok()?;
    match unit.trim() {
        "" | "s" => Some(Duration::from_secs(n)),
        "ms" => Some(Duration::from_millis(n)),
        "m" => n.checked_mul(60).map(Duration::from_secs),
        "h" => n.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}
