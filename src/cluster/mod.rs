//! # Cluster Membership API
//!
//! Boundary to the orchestrator that reports which addresses back a service.
//! [`ClusterApi`] is what the reconciler consumes; [`kubernetes::KubernetesClient`]
//! implements it against the Kubernetes REST API.

pub mod kubeconfig;
pub mod kubernetes;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::ClusterError;

pub use kubernetes::KubernetesClient;

/// Reference to the workload behind an address
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargetRef {
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndpointAddress {
    pub ip: String,
    pub target: Option<TargetRef>,
}

impl EndpointAddress {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            target: None,
        }
    }

    pub fn with_target(mut self, name: impl Into<String>, uid: impl Into<String>) -> Self {
        self.target = Some(TargetRef {
            name: name.into(),
            uid: uid.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedPort {
    pub name: Option<String>,
    pub port: u16,
}

impl NamedPort {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: Some(name.into()),
            port,
        }
    }
}

/// Raw membership of a service as reported by one event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceEndpoints {
    pub addresses: Vec<EndpointAddress>,
    pub ports: Vec<NamedPort>,
}

impl ServiceEndpoints {
    /// Numeric port for `port_name`, if the service exposes it
    pub fn resolve_port(&self, port_name: &str) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.name.as_deref() == Some(port_name))
            .map(|p| p.port)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.addresses.iter().map(|a| a.ip.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Added(ServiceEndpoints),
    Modified(ServiceEndpoints),
    /// Error object delivered inside the watch; the stream stays usable
    Error(String),
}

/// Readiness of the workload behind an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// The workload explicitly reports a failing condition
    NotReady,
    /// No conditions reported yet
    Unknown,
}

pub type MembershipStream = BoxStream<'static, Result<MembershipEvent, ClusterError>>;

/// Per-service subscription plus workload readiness lookup
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Start a fresh watch. The stream ends when the server closes the watch.
    async fn watch_endpoints(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<MembershipStream, ClusterError>;

    async fn workload_readiness(
        &self,
        namespace: &str,
        workload: &str,
    ) -> Result<Readiness, ClusterError>;
}
