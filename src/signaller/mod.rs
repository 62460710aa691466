//! # Invalidation Broadcaster
//!
//! Accepts invalidation requests (`PURGE`, `BAN`, anything) over HTTP and
//! replicates each one to every known frontend instance. The caller gets an
//! immediate acknowledgement; delivery happens on a worker pool with bounded
//! retries.
//!
//! ```text
//! inbound request ──► broadcast() ──► work queue ──► workers ──► frontends
//!                                        ▲              │
//!                                        └── retry ◄────┘ (failure, attempt < max)
//! ```

pub mod queue;
pub mod transport;
pub mod web;

use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderValue, Method, Uri};
use bytes::Bytes;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SignallerConfig;
use crate::constants::signaller::X_FORWARDED_FOR;
use crate::error::{ErrorReporter, Result, SidecarError};
use crate::watcher::{EndpointConfig, SharedEndpointConfig};

use self::queue::RetryScheduler;
use self::transport::SignalDispatcher;

pub use self::transport::HttpSignalDispatcher;

/// Current fan-out targets. Readers copy the snapshot out; writers swap it.
#[derive(Debug, Clone)]
pub struct SignalTargets {
    current: Arc<RwLock<SharedEndpointConfig>>,
}

impl Default for SignalTargets {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalTargets {
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(EndpointConfig::empty()))),
        }
    }

    pub fn replace(&self, snapshot: SharedEndpointConfig) {
        debug!(endpoints = snapshot.endpoints.len(), "signal targets replaced");
        *self.current.write() = snapshot;
    }

    pub fn snapshot(&self) -> SharedEndpointConfig {
        self.current.read().clone()
    }
}

/// Outbound request template for one target
#[derive(Debug, Clone)]
pub struct SignalRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One replication unit: a request for one target plus its retry counter
#[derive(Debug, Clone)]
pub struct Signal {
    pub request: SignalRequest,
    /// Failed attempts so far
    pub attempt: u32,
    /// Shared by all signals derived from one inbound request
    pub broadcast_id: Uuid,
}

/// Result of accepting one inbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReceipt {
    pub broadcast_id: Uuid,
    /// Signals enqueued, one per target
    pub signals: usize,
}

#[derive(Debug, Clone)]
pub struct SignallerSettings {
    pub workers: usize,
    /// Total attempts per signal, the first included
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub queue_capacity: usize,
    pub endpoint_scheme: String,
}

impl SignallerSettings {
    pub fn from_config(config: &SignallerConfig) -> Self {
        Self {
            workers: config.workers_count,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
            queue_capacity: config.queue_capacity,
            endpoint_scheme: config.endpoint_scheme.clone(),
        }
    }
}

/// Running broadcaster: queue producer side plus counters
#[derive(Debug)]
pub struct Signaller {
    settings: SignallerSettings,
    targets: SignalTargets,
    queue: mpsc::Sender<Signal>,
    retries: RetryScheduler,
    errors: ErrorReporter,
}

impl Signaller {
    /// Spawn the workers and the retry scheduler. All of them stop on `cancel`.
    pub fn start(
        settings: SignallerSettings,
        targets: SignalTargets,
        dispatcher: Arc<dyn SignalDispatcher>,
        errors: ErrorReporter,
        cancel: CancellationToken,
    ) -> Self {
        let (queue, receiver) = queue::work_queue(settings.queue_capacity);
        let (retries, _scheduler) =
            RetryScheduler::spawn(settings.retry_backoff, queue.clone(), cancel.clone());
        let _workers = queue::spawn_workers(
            settings.workers,
            receiver,
            dispatcher,
            retries.clone(),
            settings.max_retries,
            cancel,
        );

        info!(
            workers = settings.workers,
            scheme = %settings.endpoint_scheme,
            "✅ SIGNALLER: Broadcaster started"
        );
        Self {
            settings,
            targets,
            queue,
            retries,
            errors,
        }
    }

    pub fn targets(&self) -> &SignalTargets {
        &self.targets
    }

    pub fn errors(&self) -> &ErrorReporter {
        &self.errors
    }

    /// Signals currently waiting out a retry backoff
    pub fn pending_retries(&self) -> usize {
        self.retries.pending()
    }

    /// Signals waiting on the work queue
    pub fn queued(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    /// Replicate one inbound request to every current target.
    pub async fn broadcast(
        &self,
        method: Method,
        uri: &Uri,
        mut headers: HeaderMap,
        body: Bytes,
        remote: SocketAddr,
    ) -> Result<BroadcastReceipt> {
        let broadcast_id = Uuid::new_v4();
        let targets = self.targets.snapshot();

        // framing is recomputed for the buffered body
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);
        headers.remove(CONNECTION);
        if !headers.contains_key(HOST) {
            if let Some(authority) = uri.authority() {
                if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
                    headers.insert(HOST, host);
                }
            }
        }
        let forwarded_for = HeaderValue::from_str(&remote.to_string())
            .map_err(|e| SidecarError::Protocol(format!("invalid caller address: {e}")))?;
        headers.insert(X_FORWARDED_FOR, forwarded_for);

        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

        info!(
            %broadcast_id,
            %method,
            path,
            caller = %remote,
            targets = targets.endpoints.len(),
            "📣 SIGNALLER: Broadcasting signal"
        );

        for endpoint in &targets.endpoints {
            let signal = Signal {
                request: SignalRequest {
                    method: method.clone(),
                    url: format!(
                        "{}://{}:{}{}",
                        self.settings.endpoint_scheme, endpoint.host, endpoint.port, path
                    ),
                    headers: headers.clone(),
                    body: body.clone(),
                },
                attempt: 0,
                broadcast_id,
            };

            self.queue
                .send(signal)
                .await
                .map_err(|_| SidecarError::Cancelled("signal queue closed".to_string()))?;
        }

        Ok(BroadcastReceipt {
            broadcast_id,
            signals: targets.endpoints.len(),
        })
    }
}
