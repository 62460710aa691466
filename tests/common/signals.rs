//! Outbound side of the broadcaster: a scripted dispatcher and real HTTP
//! targets.

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::Router;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use httpcache_sidecar::signaller::transport::SignalDispatcher;
use httpcache_sidecar::signaller::SignalRequest;
use httpcache_sidecar::SidecarError;

/// Records every dispatch; each URL fails its first `failures` attempts.
#[derive(Default)]
pub struct ScriptedDispatcher {
    pub seen: Mutex<Vec<SignalRequest>>,
    failures: Mutex<HashMap<String, usize>>,
    default_failures: usize,
}

impl ScriptedDispatcher {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            default_failures: failures,
            ..Default::default()
        }
    }

    pub fn attempts_for(&self, url: &str) -> usize {
        self.seen.lock().iter().filter(|r| r.url == url).count()
    }

    pub fn total(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl SignalDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, request: &SignalRequest) -> httpcache_sidecar::Result<u16> {
        self.seen.lock().push(request.clone());

        let mut failures = self.failures.lock();
        let left = failures
            .entry(request.url.clone())
            .or_insert(self.default_failures);
        if *left > 0 {
            *left -= 1;
            return Err(SidecarError::Connectivity(format!("{}: connection reset", request.url)));
        }
        Ok(200)
    }
}

/// What a target cache received
#[derive(Debug, Clone)]
pub struct ReceivedSignal {
    pub method: String,
    pub path_and_query: String,
    pub host: Option<String>,
    pub forwarded_for: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct TargetLog(Arc<Mutex<Vec<ReceivedSignal>>>);

impl TargetLog {
    pub fn received(&self) -> Vec<ReceivedSignal> {
        self.0.lock().clone()
    }
}

/// Start an HTTP server standing in for one cache instance.
pub async fn spawn_target() -> (SocketAddr, TargetLog) {
    let log = TargetLog::default();
    let app = Router::new().fallback(record).with_state(log.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (address, log)
}

async fn record(State(log): State<TargetLog>, request: Request) -> StatusCode {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    log.0.lock().push(ReceivedSignal {
        method: parts.method.to_string(),
        path_and_query: parts
            .uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_default(),
        host: header("host"),
        forwarded_for: header("x-forwarded-for"),
        body: body.to_vec(),
    });
    StatusCode::OK
}
