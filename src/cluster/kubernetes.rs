//! Kubernetes REST implementation of [`ClusterApi`].
//!
//! Watches `Endpoints` objects through the streaming watch API (one JSON event
//! per line) and looks up pods for readiness. In a pod it authenticates with
//! the service account token and trusts the service account CA; outside a
//! cluster the current context of a kubeconfig supplies both.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::kubeconfig::{self, BearerToken, ClusterAccess};
use super::{
    ClusterApi, EndpointAddress, MembershipEvent, MembershipStream, NamedPort, Readiness,
    ServiceEndpoints, TargetRef,
};
use crate::config::KubernetesConfig;
use crate::constants::kubernetes as k8s;
use crate::error::ClusterError;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct KubernetesClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<BearerToken>,
}

impl KubernetesClient {
    /// Build a client from configuration. A kubeconfig takes precedence over
    /// in-cluster discovery; `api_server` overrides either server address.
    pub fn from_config(config: &KubernetesConfig) -> Result<Self, ClusterError> {
        let mut access = match &config.kubeconfig {
            Some(path) => {
                info!(kubeconfig = %path.display(), "☸️ CLUSTER: Using kubeconfig");
                kubeconfig::load(path)?
            }
            None => in_cluster_access(config)?,
        };
        if let Some(url) = &config.api_server {
            access.server = url.trim_end_matches('/').to_string();
        }
        Self::from_access(access)
    }

    pub fn from_access(access: ClusterAccess) -> Result<Self, ClusterError> {
        let mut builder = reqwest::Client::builder();
        if let Some(pem) = &access.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| ClusterError::Client(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(pem) = &access.identity_pem {
            let identity = reqwest::Identity::from_pem(pem)
                .map_err(|e| ClusterError::Client(format!("invalid client certificate: {e}")))?;
            builder = builder.identity(identity);
        }
        if access.insecure_skip_tls_verify {
            warn!("☸️ CLUSTER: TLS verification of the API server is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| ClusterError::Client(e.to_string()))?;

        info!(
            api_server = %access.server,
            token = access.token.is_some(),
            client_certificate = access.identity_pem.is_some(),
            "☸️ CLUSTER: Kubernetes client configured"
        );

        Ok(Self {
            http,
            base_url: access.server,
            token: access.token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn authorized(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, ClusterError> {
        match &self.token {
            Some(BearerToken::File(path)) => {
                let token = tokio::fs::read_to_string(path).await.map_err(|e| {
                    ClusterError::Client(format!("reading {}: {e}", path.display()))
                })?;
                Ok(request.bearer_auth(token.trim()))
            }
            Some(BearerToken::Static(token)) => Ok(request.bearer_auth(token)),
            None => Ok(request),
        }
    }
}

/// Service account material mounted into the pod, when present.
fn in_cluster_access(config: &KubernetesConfig) -> Result<ClusterAccess, ClusterError> {
    let server = match &config.api_server {
        Some(url) => url.clone(),
        None => in_cluster_base_url()?,
    };

    let ca_pem = if config.ca_file.exists() {
        Some(std::fs::read(&config.ca_file).map_err(|e| {
            ClusterError::Client(format!("reading {}: {e}", config.ca_file.display()))
        })?)
    } else {
        None
    };

    Ok(ClusterAccess {
        server,
        ca_pem,
        insecure_skip_tls_verify: false,
        token: config
            .token_file
            .exists()
            .then(|| BearerToken::File(config.token_file.clone())),
        identity_pem: None,
    })
}

fn in_cluster_base_url() -> Result<String, ClusterError> {
    let host = std::env::var(k8s::SERVICE_HOST_ENV).map_err(|_| {
        ClusterError::Client(format!(
            "no api_server configured and {} is not set",
            k8s::SERVICE_HOST_ENV
        ))
    })?;
    let port = std::env::var(k8s::SERVICE_PORT_ENV).unwrap_or_else(|_| "443".to_string());

    if host.contains(':') {
        Ok(format!("https://[{host}]:{port}"))
    } else {
        Ok(format!("https://{host}:{port}"))
    }
}

#[async_trait]
impl ClusterApi for KubernetesClient {
    async fn watch_endpoints(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<MembershipStream, ClusterError> {
        let url = format!("{}/api/v1/namespaces/{namespace}/endpoints", self.base_url);
        let selector = format!("metadata.name={service}");
        let request = self
            .http
            .get(url)
            .query(&[("watch", "true"), ("fieldSelector", selector.as_str())]);

        let watch_failed = |reason: String| ClusterError::WatchFailed {
            service: service.to_string(),
            reason,
        };

        let response = self
            .authorized(request)
            .await?
            .send()
            .await
            .map_err(|e| watch_failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(watch_failed(format!("unexpected status {}", response.status())));
        }

        debug!(namespace, service, "watch established");

        let body = response.bytes_stream().boxed();
        let stream = futures::stream::unfold((body, Vec::<u8>::new()), |(mut body, mut buf)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    match parse_watch_line(&line) {
                        Ok(Some(event)) => return Some((Ok(event), (body, buf))),
                        Ok(None) => continue,
                        Err(e) => return Some((Err(e), (body, buf))),
                    }
                }

                match body.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Some((Err(ClusterError::StreamBroken(e.to_string())), (body, buf)))
                    }
                    None => return None,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn workload_readiness(
        &self,
        namespace: &str,
        workload: &str,
    ) -> Result<Readiness, ClusterError> {
        let url = format!("{}/api/v1/namespaces/{namespace}/pods/{workload}", self.base_url);
        let lookup_failed = |reason: String| ClusterError::LookupFailed {
            name: workload.to_string(),
            reason,
        };

        let response = self
            .authorized(self.http.get(url).timeout(LOOKUP_TIMEOUT))
            .await?
            .send()
            .await
            .map_err(|e| lookup_failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(lookup_failed(format!("unexpected status {}", response.status())));
        }

        let pod: PodObject = response
            .json()
            .await
            .map_err(|e| lookup_failed(e.to_string()))?;

        Ok(pod.readiness())
    }
}

#[derive(Debug, Deserialize)]
struct WatchEventObject {
    #[serde(rename = "type")]
    kind: String,
    object: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointsObject {
    #[serde(default)]
    subsets: Option<Vec<SubsetObject>>,
}

#[derive(Debug, Default, Deserialize)]
struct SubsetObject {
    #[serde(default)]
    addresses: Option<Vec<AddressObject>>,
    #[serde(default)]
    ports: Option<Vec<PortObject>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressObject {
    ip: String,
    #[serde(default)]
    target_ref: Option<ObjectReference>,
}

#[derive(Debug, Deserialize)]
struct ObjectReference {
    #[serde(default)]
    name: String,
    #[serde(default)]
    uid: String,
}

#[derive(Debug, Deserialize)]
struct PortObject {
    #[serde(default)]
    name: Option<String>,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct StatusObject {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodObject {
    #[serde(default)]
    status: Option<PodStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    conditions: Option<Vec<PodCondition>>,
}

#[derive(Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type", default)]
    kind: String,
    status: String,
}

impl PodObject {
    /// Ready condition when reported, otherwise the first condition.
    fn readiness(&self) -> Readiness {
        let conditions = match self.status.as_ref().and_then(|s| s.conditions.as_ref()) {
            Some(conditions) if !conditions.is_empty() => conditions,
            _ => return Readiness::Unknown,
        };

        let condition = conditions
            .iter()
            .find(|c| c.kind == "Ready")
            .unwrap_or(&conditions[0]);

        if condition.status == k8s::CONDITION_TRUE {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }
}

impl From<EndpointsObject> for ServiceEndpoints {
    fn from(object: EndpointsObject) -> Self {
        let subset = object
            .subsets
            .and_then(|subsets| subsets.into_iter().next())
            .unwrap_or_default();

        ServiceEndpoints {
            addresses: subset
                .addresses
                .unwrap_or_default()
                .into_iter()
                .map(|a| EndpointAddress {
                    ip: a.ip,
                    target: a.target_ref.map(|r| TargetRef {
                        name: r.name,
                        uid: r.uid,
                    }),
                })
                .collect(),
            ports: subset
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|p| NamedPort {
                    name: p.name,
                    port: p.port,
                })
                .collect(),
        }
    }
}

/// Parse one watch line. `Ok(None)` for events the reconciler ignores.
fn parse_watch_line(line: &[u8]) -> Result<Option<MembershipEvent>, ClusterError> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let event: WatchEventObject = serde_json::from_slice(line)
        .map_err(|e| ClusterError::StreamBroken(format!("undecodable watch event: {e}")))?;

    let decode = |value: serde_json::Value| -> Result<ServiceEndpoints, ClusterError> {
        serde_json::from_value::<EndpointsObject>(value)
            .map(ServiceEndpoints::from)
            .map_err(|e| ClusterError::StreamBroken(format!("undecodable endpoints object: {e}")))
    };

    match event.kind.as_str() {
        "ADDED" => Ok(Some(MembershipEvent::Added(decode(event.object)?))),
        "MODIFIED" => Ok(Some(MembershipEvent::Modified(decode(event.object)?))),
        "ERROR" => {
            let message = serde_json::from_value::<StatusObject>(event.object)
                .map(|s| s.message)
                .unwrap_or_else(|e| e.to_string());
            Ok(Some(MembershipEvent::Error(message)))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_added_event_with_first_subset() {
        let line = br#"{"type":"ADDED","object":{"kind":"Endpoints","subsets":[{"addresses":[{"ip":"10.0.0.1","targetRef":{"kind":"Pod","name":"web-0","uid":"u-1"}}],"ports":[{"name":"http","port":8080,"protocol":"TCP"}]},{"addresses":[{"ip":"10.9.9.9"}]}]}}"#;

        let event = parse_watch_line(line).unwrap().unwrap();
        let endpoints = match event {
            MembershipEvent::Added(endpoints) => endpoints,
            other => panic!("expected Added, got {other:?}"),
        };

        assert_eq!(endpoints.addresses.len(), 1);
        assert_eq!(endpoints.addresses[0].ip, "10.0.0.1");
        assert_eq!(endpoints.addresses[0].target.as_ref().unwrap().name, "web-0");
        assert_eq!(endpoints.resolve_port("http"), Some(8080));
    }

    #[test]
    fn null_subsets_decode_as_empty() {
        let line = br#"{"type":"MODIFIED","object":{"kind":"Endpoints","subsets":null}}"#;

        let event = parse_watch_line(line).unwrap().unwrap();
        assert_eq!(event, MembershipEvent::Modified(ServiceEndpoints::default()));
    }

    #[test]
    fn error_events_carry_status_message() {
        let line = br#"{"type":"ERROR","object":{"kind":"Status","message":"too old resource version"}}"#;

        let event = parse_watch_line(line).unwrap().unwrap();
        assert_eq!(event, MembershipEvent::Error("too old resource version".into()));
    }

    #[test]
    fn deleted_and_bookmark_events_are_ignored() {
        assert_eq!(parse_watch_line(br#"{"type":"DELETED","object":{}}"#).unwrap(), None);
        assert_eq!(parse_watch_line(br#"{"type":"BOOKMARK","object":{}}"#).unwrap(), None);
        assert_eq!(parse_watch_line(b"  \n").unwrap(), None);
    }

    #[test]
    fn garbage_is_a_broken_stream() {
        let err = parse_watch_line(b"{not json").unwrap_err();
        assert!(matches!(err, ClusterError::StreamBroken(_)));
    }

    #[test]
    fn kubeconfig_server_and_token_are_used() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config");
        std::fs::write(
            &path,
            r#"
current-context: dev
clusters:
  - name: dev
    cluster:
      server: http://127.0.0.1:8001/
contexts:
  - name: dev
    context:
      cluster: dev
      user: dev
users:
  - name: dev
    user:
      token: dev-token
"#,
        )
        .unwrap();

        let config = KubernetesConfig {
            kubeconfig: Some(path),
            ..KubernetesConfig::default()
        };
        let client = KubernetesClient::from_config(&config).unwrap();

        assert_eq!(client.base_url(), "http://127.0.0.1:8001");
        assert_eq!(client.token, Some(BearerToken::Static("dev-token".into())));
    }

    #[test]
    fn explicit_api_server_overrides_kubeconfig() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config");
        std::fs::write(
            &path,
            "current-context: a\nclusters:\n  - name: a\n    cluster:\n      server: https://a:6443\ncontexts:\n  - name: a\n    context:\n      cluster: a\n",
        )
        .unwrap();

        let config = KubernetesConfig {
            kubeconfig: Some(path),
            api_server: Some("http://proxy:8001/".into()),
            ..KubernetesConfig::default()
        };
        let client = KubernetesClient::from_config(&config).unwrap();

        assert_eq!(client.base_url(), "http://proxy:8001");
        assert!(client.token.is_none());
    }

    #[test]
    fn pod_readiness_prefers_ready_condition() {
        let pod: PodObject = serde_json::from_str(
            r#"{"status":{"conditions":[{"type":"Initialized","status":"True"},{"type":"Ready","status":"False"}]}}"#,
        )
        .unwrap();
        assert_eq!(pod.readiness(), Readiness::NotReady);

        let pod: PodObject =
            serde_json::from_str(r#"{"status":{"conditions":[{"type":"Ready","status":"True"}]}}"#).unwrap();
        assert_eq!(pod.readiness(), Readiness::Ready);

        let pod: PodObject = serde_json::from_str(r#"{"status":{}}"#).unwrap();
        assert_eq!(pod.readiness(), Readiness::Unknown);
    }
}
