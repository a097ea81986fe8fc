//! Prometheus 抓取端点
//!
//! 只响应 `GET /metrics`，每个连接处理一个请求后关闭。

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use flare_notify::metrics::gather_metrics;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics endpoint on {addr}"))
}

/// 服务指标请求，直到收到停机信号
pub async fn serve(listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "metrics endpoint listening");

    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tokio::spawn(async move {
                        if let Err(e) = respond(socket).await {
                            debug!(peer = %peer, error = %e, "metrics request failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "failed to accept metrics connection"),
            }
        }
    }
    Ok(())
}

async fn respond(mut socket: TcpStream) -> io::Result<()> {
    let mut buf = [0u8; 1024];
    let n = tokio::time::timeout(READ_TIMEOUT, socket.read(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request timed out"))??;

    let request = String::from_utf8_lossy(&buf[..n]);
    let mut parts = request.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts
        .next()
        .and_then(|target| target.split('?').next())
        .unwrap_or_default();

    let (status, content_type, body) = match (method, path) {
        ("GET", "/metrics") => ("200 OK", PROMETHEUS_CONTENT_TYPE, gather_metrics()),
        _ => ("404 Not Found", "text/plain", "not found\n".to_string()),
    };
    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use flare_notify::metrics::NotifyWorkerMetrics;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_metrics_are_scrapable() {
        let metrics = NotifyWorkerMetrics::new();
        metrics.partial_fanout_total.inc();

        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, shutdown_rx));

        let response = get(addr, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("notify_partial_fanout_total"));

        let response = get(addr, "/").await;
        assert!(response.starts_with("HTTP/1.1 404"));

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
