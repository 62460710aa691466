//! # Endpoint Reconciler
//!
//! Turns the raw, noisy membership event stream of one service into published
//! [`EndpointConfig`] snapshots, emitted only when the effective membership
//! changes.
//!
//! Per event:
//! 1. no addresses: publish the canonical empty snapshot
//! 2. resolve the named port (failure is a configuration defect)
//! 3. drop the event when the raw host set equals the current one
//! 4. drop workloads that explicitly report not-ready
//! 5. pair survivors with the resolved port
//! 6. keep the previous primary while it is still a member
//! 7. store and publish
//!
//! Watch failures are retried forever with a fixed backoff; each failure is
//! also reported on the side error path.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::endpoints::{Endpoint, EndpointConfig, EndpointList, SharedEndpointConfig};
use crate::cluster::{ClusterApi, MembershipEvent, Readiness, ServiceEndpoints};
use crate::config::WatchedServiceConfig;
use crate::error::{ClusterError, ErrorReporter, Result};

/// Result of reconciling one membership observation
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Publish(SharedEndpointConfig),
    Unchanged,
}

/// Reconciler for one watched service
pub struct EndpointReconciler {
    api: Arc<dyn ClusterApi>,
    namespace: String,
    service: String,
    port_name: String,
    retry_backoff: Duration,
    /// Last published snapshot
    current: SharedEndpointConfig,
    /// Whether anything has been published yet
    published: bool,
}

impl std::fmt::Debug for EndpointReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointReconciler")
            .field("api", &"ClusterApi")
            .field("namespace", &self.namespace)
            .field("service", &self.service)
            .field("port_name", &self.port_name)
            .field("retry_backoff", &self.retry_backoff)
            .field("current", &self.current)
            .field("published", &self.published)
            .finish()
    }
}

impl EndpointReconciler {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        settings: &WatchedServiceConfig,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            api,
            namespace: settings.namespace.clone(),
            service: settings.service.clone(),
            port_name: settings.port_name.clone(),
            retry_backoff,
            current: Arc::new(EndpointConfig::empty()),
            published: false,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Most recently published snapshot (empty before the first publication)
    pub fn current(&self) -> SharedEndpointConfig {
        self.current.clone()
    }

    /// Apply one raw membership observation
    pub async fn reconcile(
        &mut self,
        endpoints: ServiceEndpoints,
    ) -> std::result::Result<ReconcileOutcome, ClusterError> {
        if endpoints.addresses.is_empty() {
            warn!(service = %self.service, "service has no endpoints");
            return Ok(self.publish_empty());
        }

        let port = endpoints
            .resolve_port(&self.port_name)
            .ok_or_else(|| ClusterError::PortNotFound {
                service: self.service.clone(),
                port_name: self.port_name.clone(),
            })?;

        if self.published && self.current.endpoints.equals_hosts(endpoints.hosts()) {
            info!(service = %self.service, "endpoints did not change");
            return Ok(ReconcileOutcome::Unchanged);
        }

        let mut survivors = Vec::with_capacity(endpoints.addresses.len());
        for address in endpoints.addresses {
            let Some(target) = &address.target else {
                survivors.push(address);
                continue;
            };

            match self.api.workload_readiness(&self.namespace, &target.name).await {
                Ok(Readiness::NotReady) => {
                    info!(service = %self.service, workload = %target.name, uid = %target.uid, "skipping endpoint (not healthy)");
                }
                Ok(_) => survivors.push(address),
                Err(e) => {
                    error!(service = %self.service, workload = %target.name, error = %e, "error while locating endpoint");
                }
            }
        }

        if survivors.is_empty() {
            warn!(service = %self.service, "service has no endpoint that is ready");
            return Ok(self.publish_empty());
        }

        let port = port.to_string();
        let list: EndpointList = survivors
            .into_iter()
            .map(|address| Endpoint {
                name: address.target.map(|t| t.name).unwrap_or_default(),
                host: address.ip,
                port: port.clone(),
                probe: None,
            })
            .collect();

        let snapshot = EndpointConfig::with_stable_primary(list, self.current.primary.as_ref());

        if self.published && snapshot.endpoints.same_addresses(&self.current.endpoints) {
            debug!(service = %self.service, "healthy endpoints did not change");
            return Ok(ReconcileOutcome::Unchanged);
        }

        Ok(self.store(snapshot))
    }

    fn publish_empty(&mut self) -> ReconcileOutcome {
        if self.published && self.current.is_empty() {
            return ReconcileOutcome::Unchanged;
        }
        self.store(EndpointConfig::empty())
    }

    fn store(&mut self, snapshot: EndpointConfig) -> ReconcileOutcome {
        let snapshot = Arc::new(snapshot);
        self.current = snapshot.clone();
        self.published = true;
        ReconcileOutcome::Publish(snapshot)
    }

    /// Run [`Self::run`] on its own task
    pub fn spawn(
        self,
        updates: mpsc::Sender<SharedEndpointConfig>,
        errors: ErrorReporter,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(updates, errors, cancel))
    }

    /// Watch, reconcile and publish until cancelled or the consumer goes away.
    ///
    /// Returns an error only for an unresolvable port before the first
    /// publication: that is a setup defect no retry will fix.
    #[instrument(skip_all, fields(service = %self.service))]
    pub async fn run(
        mut self,
        updates: mpsc::Sender<SharedEndpointConfig>,
        errors: ErrorReporter,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(namespace = %self.namespace, port_name = %self.port_name, "👀 RECONCILER: Starting endpoint watch");

        loop {
            let watch = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                watch = self.api.watch_endpoints(&self.namespace, &self.service) => watch,
            };

            let mut stream = match watch {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "error while establishing watch");
                    errors.report(e.into());
                    if !self.backoff(&cancel).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    next = stream.next() => next,
                };

                let endpoints = match next {
                    None => {
                        debug!("watch has ended, starting new watch");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "watch stream failed");
                        errors.report(e.into());
                        if !self.backoff(&cancel).await {
                            return Ok(());
                        }
                        break;
                    }
                    Some(Ok(MembershipEvent::Error(message))) => {
                        warn!(%message, "error while watching");
                        continue;
                    }
                    Some(Ok(MembershipEvent::Added(endpoints)))
                    | Some(Ok(MembershipEvent::Modified(endpoints))) => endpoints,
                };

                match self.reconcile(endpoints).await {
                    Ok(ReconcileOutcome::Publish(snapshot)) => {
                        info!(
                            endpoints = snapshot.endpoints.len(),
                            primary = ?snapshot.primary.as_ref().map(|p| p.to_string()),
                            "📡 RECONCILER: Publishing membership snapshot"
                        );
                        let sent = tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            sent = updates.send(snapshot) => sent,
                        };
                        if sent.is_err() {
                            info!("snapshot consumer closed, stopping watch");
                            return Ok(());
                        }
                    }
                    Ok(ReconcileOutcome::Unchanged) => {}
                    Err(e @ ClusterError::PortNotFound { .. }) if !self.published => {
                        error!(error = %e, "❌ RECONCILER: Cannot resolve service port");
                        return Err(e.into());
                    }
                    Err(e) => {
                        error!(error = %e, "error while building endpoint list");
                        errors.report(e.into());
                    }
                }
            }
        }
    }

    /// Sleep the retry backoff; `false` when cancelled meanwhile.
    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        info!("retrying after {:?}", self.retry_backoff);
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.retry_backoff) => true,
        }
    }
}
