//! HTTP surface of the broadcaster. Every method and path is accepted.

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::Signaller;
use crate::constants::signaller::ACK_BODY;
use crate::error::{Result, SidecarError};

/// Router with a single catch-all handler
pub fn router(signaller: Arc<Signaller>) -> Router {
    Router::new()
        .fallback(handle_signal)
        .layer(TraceLayer::new_for_http())
        .with_state(signaller)
}

async fn handle_signal(
    State(signaller): State<Arc<Signaller>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to read signal request body");
            signaller
                .errors()
                .report(SidecarError::Io(format!("reading signal request body: {e}")));
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    match signaller
        .broadcast(parts.method, &parts.uri, parts.headers, body, remote)
        .await
    {
        Ok(_) => (StatusCode::OK, ACK_BODY).into_response(),
        Err(e) => {
            signaller.errors().report(e.clone());
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

pub async fn bind(address: &str) -> Result<TcpListener> {
    TcpListener::bind(address)
        .await
        .map_err(|e| SidecarError::Configuration(format!("cannot bind signaller to {address}: {e}")))
}

/// Serve until `cancel` fires.
pub async fn serve(
    signaller: Arc<Signaller>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!(address = %local, "🌐 SIGNALLER: Listening for invalidation requests");

    axum::serve(
        listener,
        router(signaller).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await?;

    info!("signaller server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorReporter, ErrorSource};
    use crate::signaller::transport::SignalDispatcher;
    use crate::signaller::{SignalRequest, SignalTargets, SignallerSettings};
    use crate::watcher::{Endpoint, EndpointConfig, EndpointList};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    #[derive(Default)]
    struct Recording(Mutex<Vec<SignalRequest>>);

    #[async_trait]
    impl SignalDispatcher for Recording {
        async fn dispatch(&self, request: &SignalRequest) -> Result<u16> {
            self.0.lock().push(request.clone());
            Ok(200)
        }
    }

    fn signaller(dispatcher: Arc<Recording>, cancel: CancellationToken) -> Arc<Signaller> {
        let targets = SignalTargets::new();
        let list: EndpointList = ["10.0.0.1", "10.0.0.2"]
            .iter()
            .map(|h| Endpoint::new(*h, "80"))
            .collect();
        targets.replace(Arc::new(EndpointConfig::with_stable_primary(list, None)));
        let (errors, _rx) = ErrorReporter::channel(ErrorSource::Signaller);

        Arc::new(Signaller::start(
            SignallerSettings {
                workers: 1,
                max_retries: 1,
                retry_backoff: Duration::from_secs(1),
                queue_capacity: 8,
                endpoint_scheme: "http".to_string(),
            },
            targets,
            dispatcher,
            errors,
            cancel,
        ))
    }

    #[tokio::test]
    async fn any_method_and_path_is_acknowledged_and_replicated() {
        let dispatcher = Arc::new(Recording::default());
        let cancel = CancellationToken::new();
        let app = router(signaller(dispatcher.clone(), cancel.clone()));

        let mut request = axum::http::Request::builder()
            .method("PURGE")
            .uri("/foo/bar?x=1")
            .header("host", "shop.example.com")
            .body(Body::from("payload"))
            .unwrap();
        let caller: SocketAddr = "198.51.100.7:5000".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(caller));

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], ACK_BODY.as_bytes());

        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.0.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let seen = dispatcher.0.lock().clone();
        assert!(seen.iter().all(|r| r.url.ends_with(":80/foo/bar?x=1")));
        assert!(seen.iter().all(|r| &r.body[..] == b"payload"));
        assert!(seen.iter().all(|r| r.headers["x-forwarded-for"] == "198.51.100.7:5000"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn serves_over_tcp_until_cancelled() {
        let dispatcher = Arc::new(Recording::default());
        let cancel = CancellationToken::new();
        let listener = bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(
            signaller(dispatcher.clone(), cancel.clone()),
            listener,
            cancel.clone(),
        ));

        let response = reqwest::Client::new()
            .request(reqwest::Method::from_bytes(b"BAN").unwrap(), format!("http://{address}/"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), ACK_BODY);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
