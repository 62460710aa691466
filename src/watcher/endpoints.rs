//! Membership model: endpoints, endpoint lists and published snapshots.
//!
//! Identity of an [`Endpoint`] is its `(host, port)` pair; `name` and `probe`
//! are informational. Snapshots ([`EndpointConfig`]) are immutable once
//! published and are shared as `Arc<EndpointConfig>`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Health probe settings a template may render for an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndpointProbe {
    pub url: String,
    pub interval: u32,
    pub timeout: u32,
    pub window: u32,
    pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Endpoint {
    /// Name of the workload backing this address, when known
    pub name: String,
    pub host: String,
    pub port: String,
    pub probe: Option<EndpointProbe>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            host: host.into(),
            port: port.into(),
            probe: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Identity comparison: host and port only.
    pub fn same_address(&self, other: &Endpoint) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Ordered endpoints; index 0 is the default primary candidate
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointList(Vec<Endpoint>);

impl EndpointList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&Endpoint> {
        self.0.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Endpoint> {
        self.0.iter()
    }

    /// Whether an endpoint with the same `(host, port)` is present
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.0.iter().any(|e| e.same_address(endpoint))
    }

    /// Find the member with the same identity as `endpoint`
    pub fn find(&self, endpoint: &Endpoint) -> Option<&Endpoint> {
        self.0.iter().find(|e| e.same_address(endpoint))
    }

    /// Compare the host set against a raw address list, ignoring ports and order
    pub fn equals_hosts<'a, I>(&self, hosts: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let hosts: Vec<&str> = hosts.into_iter().collect();
        if hosts.len() != self.0.len() {
            return false;
        }

        let known: HashSet<&str> = self.0.iter().map(|e| e.host.as_str()).collect();
        hosts.iter().all(|h| known.contains(h))
    }

    /// Same `(host, port)` set, order ignored
    pub fn same_addresses(&self, other: &EndpointList) -> bool {
        self.len() == other.len() && self.0.iter().all(|e| other.contains(e))
    }
}

impl From<Vec<Endpoint>> for EndpointList {
    fn from(endpoints: Vec<Endpoint>) -> Self {
        Self(endpoints)
    }
}

impl FromIterator<Endpoint> for EndpointList {
    fn from_iter<T: IntoIterator<Item = Endpoint>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a EndpointList {
    type Item = &'a Endpoint;
    type IntoIter = std::slice::Iter<'a, Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Published membership snapshot for one watched service
///
/// `primary`, when set, is always a member of `endpoints`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub endpoints: EndpointList,
    pub primary: Option<Endpoint>,
}

/// Shared handle to a published snapshot
pub type SharedEndpointConfig = Arc<EndpointConfig>;

impl EndpointConfig {
    /// The canonical empty snapshot: no endpoints, no primary
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from a fresh list, keeping `previous_primary` when it
    /// is still a member and falling back to the first element otherwise.
    pub fn with_stable_primary(endpoints: EndpointList, previous_primary: Option<&Endpoint>) -> Self {
        let primary = previous_primary
            .and_then(|prev| endpoints.find(prev))
            .or_else(|| endpoints.first())
            .cloned();

        Self { endpoints, primary }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
