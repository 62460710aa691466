//! Outbound delivery of one signal.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::SignalRequest;
use crate::error::{Result, SidecarError};

/// Executes one outbound request. `Ok` carries the response status, whatever
/// it is; `Err` means no response was received.
#[async_trait]
pub trait SignalDispatcher: Send + Sync {
    async fn dispatch(&self, request: &SignalRequest) -> Result<u16>;
}

/// Whether a delivery counts as done
pub fn is_delivered(status: u16) -> bool {
    !(400..=599).contains(&status)
}

/// reqwest-backed dispatcher
#[derive(Debug, Clone)]
pub struct HttpSignalDispatcher {
    client: reqwest::Client,
}

impl HttpSignalDispatcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SidecarError::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SignalDispatcher for HttpSignalDispatcher {
    async fn dispatch(&self, request: &SignalRequest) -> Result<u16> {
        let response = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| SidecarError::Connectivity(format!("{}: {e}", request.url)))?;

        let status = response.status().as_u16();

        // drain so the connection can be reused
        if let Err(e) = response.bytes().await {
            debug!(url = %request.url, error = %e, "error while draining signal response");
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue, Method};
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn client_and_server_errors_are_not_deliveries() {
        assert!(is_delivered(200));
        assert!(is_delivered(204));
        assert!(is_delivered(301));
        assert!(!is_delivered(400));
        assert!(!is_delivered(404));
        assert!(!is_delivered(503));
        assert!(!is_delivered(599));
        assert!(is_delivered(600));
    }

    /// One-shot HTTP peer returning `status`; yields the raw request text.
    async fn one_shot_server(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut received = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                if n == 0 || received.windows(4).any(|w| w == b"\r\n\r\n") && received.ends_with(b"gone") {
                    break;
                }
            }
            let response = format!("HTTP/1.1 {status}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok");
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });
        (address, handle)
    }

    #[tokio::test]
    async fn forwards_method_headers_and_body() {
        let (address, server) = one_shot_server("200 OK").await;
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("cache.example.com"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.9.9.9:5555"));

        let request = SignalRequest {
            method: Method::from_bytes(b"PURGE").unwrap(),
            url: format!("http://{address}/foo?bar=1"),
            headers,
            body: Bytes::from_static(b"gone"),
        };

        let status = HttpSignalDispatcher::new(Duration::from_secs(5))
            .unwrap()
            .dispatch(&request)
            .await
            .unwrap();
        assert_eq!(status, 200);

        let raw = server.await.unwrap().to_lowercase();
        assert!(raw.starts_with("purge /foo?bar=1 http/1.1"));
        assert!(raw.contains("host: cache.example.com"));
        assert!(raw.contains("x-forwarded-for: 10.9.9.9:5555"));
        assert!(raw.ends_with("gone"));
    }

    #[tokio::test]
    async fn error_status_is_returned_not_raised() {
        let (address, _server) = one_shot_server("503 Service Unavailable").await;
        let request = SignalRequest {
            method: Method::from_bytes(b"BAN").unwrap(),
            url: format!("http://{address}/"),
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"gone"),
        };

        let status = HttpSignalDispatcher::new(Duration::from_secs(5))
            .unwrap()
            .dispatch(&request)
            .await
            .unwrap();
        assert_eq!(status, 503);
        assert!(!is_delivered(status));
    }

    #[tokio::test]
    async fn unreachable_target_is_a_connectivity_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let request = SignalRequest {
            method: Method::from_bytes(b"PURGE").unwrap(),
            url: format!("http://{address}/foo"),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        let err = HttpSignalDispatcher::new(Duration::from_secs(2))
            .unwrap()
            .dispatch(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, SidecarError::Connectivity(_)));
    }
}
