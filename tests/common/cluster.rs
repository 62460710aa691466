//! In-memory membership API.
//!
//! Each call to `watch_endpoints` takes the next queued [`WatchFeed`]; the
//! test pushes events through the feed and ends the watch by dropping it.
//! With no feed queued the watch stays open and silent.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use httpcache_sidecar::cluster::{EndpointAddress, MembershipStream, NamedPort};
use httpcache_sidecar::{ClusterApi, ClusterError, MembershipEvent, Readiness, ServiceEndpoints};

type WatchItem = Result<MembershipEvent, ClusterError>;

#[derive(Default)]
pub struct FakeCluster {
    feeds: Mutex<VecDeque<mpsc::UnboundedReceiver<WatchItem>>>,
    readiness: Mutex<HashMap<String, Result<Readiness, ClusterError>>>,
    failing_watches: AtomicUsize,
    watches: AtomicUsize,
    lookups: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the event source for the next watch.
    pub fn next_watch(&self) -> WatchFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().push_back(rx);
        WatchFeed(tx)
    }

    /// Make the next `count` watch attempts fail outright.
    pub fn fail_watches(&self, count: usize) {
        self.failing_watches.store(count, Ordering::SeqCst);
    }

    pub fn set_readiness(&self, workload: &str, readiness: Readiness) {
        self.readiness
            .lock()
            .insert(workload.to_string(), Ok(readiness));
    }

    pub fn fail_lookup(&self, workload: &str) {
        self.readiness.lock().insert(
            workload.to_string(),
            Err(ClusterError::LookupFailed {
                name: workload.to_string(),
                reason: "not found".to_string(),
            }),
        );
    }

    /// Watch attempts so far, failed ones included
    pub fn watches(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn watch_endpoints(
        &self,
        _namespace: &str,
        service: &str,
    ) -> Result<MembershipStream, ClusterError> {
        self.watches.fetch_add(1, Ordering::SeqCst);

        let failing = self.failing_watches.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_watches.store(failing - 1, Ordering::SeqCst);
            return Err(ClusterError::WatchFailed {
                service: service.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        match self.feeds.lock().pop_front() {
            Some(rx) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            None => Ok(futures::stream::pending::<WatchItem>().boxed()),
        }
    }

    async fn workload_readiness(
        &self,
        _namespace: &str,
        workload: &str,
    ) -> Result<Readiness, ClusterError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.readiness
            .lock()
            .get(workload)
            .cloned()
            .unwrap_or(Ok(Readiness::Ready))
    }
}

/// Sending side of one watch
pub struct WatchFeed(mpsc::UnboundedSender<WatchItem>);

impl WatchFeed {
    pub fn added(&self, endpoints: ServiceEndpoints) {
        let _ = self.0.send(Ok(MembershipEvent::Added(endpoints)));
    }

    pub fn modified(&self, endpoints: ServiceEndpoints) {
        let _ = self.0.send(Ok(MembershipEvent::Modified(endpoints)));
    }

    pub fn error_event(&self, message: &str) {
        let _ = self.0.send(Ok(MembershipEvent::Error(message.to_string())));
    }

    /// Break the stream with a transport error
    pub fn broken(&self, message: &str) {
        let _ = self.0.send(Err(ClusterError::StreamBroken(message.to_string())));
    }
}

/// Addresses named `pod-<last octet>` exposing one named port
pub fn service_endpoints(hosts: &[&str], port_name: &str, port: u16) -> ServiceEndpoints {
    ServiceEndpoints {
        addresses: hosts
            .iter()
            .map(|host| {
                let octet = host.rsplit('.').next().unwrap_or_default();
                EndpointAddress::new(*host).with_target(format!("pod-{octet}"), format!("uid-{octet}"))
            })
            .collect(),
        ports: vec![NamedPort::new(port_name, port)],
    }
}

pub fn http_endpoints(hosts: &[&str]) -> ServiceEndpoints {
    service_endpoints(hosts, "http", 8080)
}
