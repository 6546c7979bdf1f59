//! Liveness probes used by the fail-server coordinator.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use metacache_state::Server;

use crate::ping::ping;

/// Decides whether a server whose registration vanished is still running.
#[async_trait]
pub trait LivenessProbe: Send + Sync + 'static {
    async fn is_alive(&self, server: &Server) -> bool;
}

/// Pings the server's RPC address over HTTP with a bounded timeout.
#[derive(Debug, Clone)]
pub struct HttpLivenessProbe {
    path: String,
    timeout: Duration,
}

impl HttpLivenessProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            path: "/".to_string(),
            timeout,
        }
    }

    /// Probe `path` instead of `/`.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}

impl Default for HttpLivenessProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl LivenessProbe for HttpLivenessProbe {
    async fn is_alive(&self, server: &Server) -> bool {
        let addr = server.rpc_addr();
        match ping(&addr, &self.path, self.timeout).await {
            Ok(status) => {
                debug!(node_id = server.id, %addr, %status, "server answered");
                true
            }
            Err(e) => {
                debug!(node_id = server.id, %addr, error = %e, "server did not answer");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn server_at(addr: std::net::SocketAddr) -> Server {
        Server {
            id: 3,
            ip: addr.ip().to_string(),
            rpc_port: addr.port(),
            resource_name: "default".to_string(),
            partition_ids: vec![1],
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_dead() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = HttpLivenessProbe::new(Duration::from_millis(500));
        assert!(!probe.is_alive(&server_at(addr)).await);
    }

    #[tokio::test]
    async fn answering_server_is_alive() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 405 Method Not Allowed\r\ncontent-length: 0\r\n\r\n")
                .await;
        });

        let probe = HttpLivenessProbe::new(Duration::from_secs(2)).with_path("/ping");
        assert!(probe.is_alive(&server_at(addr)).await);
    }
}
