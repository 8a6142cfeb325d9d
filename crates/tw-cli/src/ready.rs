//! Readiness check for the local listener

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

/// Interval between connection attempts
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll-connect `127.0.0.1:port` until it accepts or `timeout` elapses
pub async fn wait_for_port(port: u16, timeout: Duration) -> anyhow::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if let Ok(Ok(stream)) = tokio::time::timeout(POLL_INTERVAL, TcpStream::connect(addr)).await {
            drop(stream);
            tracing::debug!("Port {} is accepting connections", port);
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    anyhow::bail!("timeout waiting for port {}", port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_ready_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        wait_for_port(port, Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_port_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = wait_for_port(port, Duration::from_millis(300)).await.unwrap_err();
        assert_eq!(err.to_string(), format!("timeout waiting for port {}", port));
    }
}
