//! Out-of-cluster access through a kubeconfig file.
//!
//! Only the current context is read. File references inside the kubeconfig are
//! relative to the kubeconfig's own directory, and `*-data` fields carry base64
//! encoded PEM.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ClusterError;

/// How requests are authorized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BearerToken {
    /// Read before every request, projected tokens rotate
    File(PathBuf),
    Static(String),
}

/// Everything needed to reach the API server for one context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAccess {
    pub server: String,
    pub ca_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
    pub token: Option<BearerToken>,
    /// Client certificate followed by its private key
    pub identity_pem: Option<Vec<u8>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    #[serde(default)]
    current_context: String,
    #[serde(default)]
    clusters: Vec<Named<ClusterEntry>>,
    #[serde(default)]
    contexts: Vec<Named<ContextEntry>>,
    #[serde(default)]
    users: Vec<Named<UserEntry>>,
}

#[derive(Debug, Deserialize)]
struct Named<T> {
    name: String,
    #[serde(alias = "cluster", alias = "context", alias = "user")]
    item: T,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(default)]
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
    #[serde(default, rename = "tokenFile")]
    token_file: Option<PathBuf>,
    #[serde(default)]
    client_certificate: Option<PathBuf>,
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    client_key: Option<PathBuf>,
    #[serde(default)]
    client_key_data: Option<String>,
}

fn client_error(reason: impl Into<String>) -> ClusterError {
    ClusterError::Client(reason.into())
}

fn lookup<'a, T>(entries: &'a [Named<T>], kind: &str, name: &str) -> Result<&'a T, ClusterError> {
    entries
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| &entry.item)
        .ok_or_else(|| client_error(format!("kubeconfig has no {kind} named '{name}'")))
}

/// Inline data wins over a file reference, as in kubectl.
fn pem_material(
    data: Option<&str>,
    file: Option<&Path>,
    base_dir: &Path,
    what: &str,
) -> Result<Option<Vec<u8>>, ClusterError> {
    if let Some(data) = data {
        return STANDARD
            .decode(data.trim())
            .map(Some)
            .map_err(|e| client_error(format!("{what} data is not valid base64: {e}")));
    }
    match file {
        Some(path) => {
            let path = base_dir.join(path);
            std::fs::read(&path)
                .map(Some)
                .map_err(|e| client_error(format!("reading {what} {}: {e}", path.display())))
        }
        None => Ok(None),
    }
}

/// Resolve the current context of the kubeconfig at `path`.
pub fn load(path: &Path) -> Result<ClusterAccess, ClusterError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| client_error(format!("reading kubeconfig {}: {e}", path.display())))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    resolve(&text, base_dir)
}

fn resolve(text: &str, base_dir: &Path) -> Result<ClusterAccess, ClusterError> {
    let config: Kubeconfig = serde_yaml::from_str(text)
        .map_err(|e| client_error(format!("invalid kubeconfig: {e}")))?;

    if config.current_context.is_empty() {
        return Err(client_error("kubeconfig has no current-context"));
    }
    let context = lookup(&config.contexts, "context", &config.current_context)?;
    let cluster = lookup(&config.clusters, "cluster", &context.cluster)?;
    let user = if context.user.is_empty() {
        None
    } else {
        Some(lookup(&config.users, "user", &context.user)?)
    };

    let ca_pem = pem_material(
        cluster.certificate_authority_data.as_deref(),
        cluster.certificate_authority.as_deref(),
        base_dir,
        "certificate authority",
    )?;

    let (token, identity_pem) = match user {
        None => (None, None),
        Some(user) => {
            let token = match (&user.token, &user.token_file) {
                (Some(token), _) => Some(BearerToken::Static(token.clone())),
                (None, Some(file)) => Some(BearerToken::File(base_dir.join(file))),
                (None, None) => None,
            };
            let cert = pem_material(
                user.client_certificate_data.as_deref(),
                user.client_certificate.as_deref(),
                base_dir,
                "client certificate",
            )?;
            let key = pem_material(
                user.client_key_data.as_deref(),
                user.client_key.as_deref(),
                base_dir,
                "client key",
            )?;
            let identity = match (cert, key) {
                (Some(mut cert), Some(key)) => {
                    cert.push(b'\n');
                    cert.extend_from_slice(&key);
                    Some(cert)
                }
                (None, None) => None,
                _ => {
                    return Err(client_error(
                        "client certificate and client key must be given together",
                    ))
                }
            };
            (token, identity)
        }
    };

    Ok(ClusterAccess {
        server: cluster.server.trim_end_matches('/').to_string(),
        ca_pem,
        insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
        token,
        identity_pem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: staging
clusters:
  - name: prod
    cluster:
      server: https://prod.example.com:6443
  - name: stage
    cluster:
      server: https://stage.example.com:6443/
      certificate-authority-data: Q0EgUEVN
contexts:
  - name: production
    context:
      cluster: prod
      user: admin
  - name: staging
    context:
      cluster: stage
      user: deployer
      namespace: web
users:
  - name: admin
    user:
      token: prod-token
  - name: deployer
    user:
      token: stage-token
"#;

    #[test]
    fn current_context_selects_cluster_and_user() {
        let access = resolve(KUBECONFIG, Path::new("/etc/kube")).unwrap();

        assert_eq!(access.server, "https://stage.example.com:6443");
        assert_eq!(access.ca_pem.as_deref(), Some(&b"CA PEM"[..]));
        assert_eq!(access.token, Some(BearerToken::Static("stage-token".into())));
        assert!(access.identity_pem.is_none());
        assert!(!access.insecure_skip_tls_verify);
    }

    #[test]
    fn file_references_resolve_next_to_the_kubeconfig() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ca.crt"), "CA").unwrap();
        std::fs::write(dir.path().join("client.crt"), "CERT").unwrap();
        std::fs::write(dir.path().join("client.key"), "KEY").unwrap();
        let path = dir.path().join("config");
        std::fs::write(
            &path,
            r#"
current-context: local
clusters:
  - name: kind
    cluster:
      server: https://127.0.0.1:6443
      certificate-authority: ca.crt
contexts:
  - name: local
    context:
      cluster: kind
      user: kind-admin
users:
  - name: kind-admin
    user:
      client-certificate: client.crt
      client-key: client.key
      tokenFile: token
"#,
        )
        .unwrap();

        let access = load(&path).unwrap();

        assert_eq!(access.ca_pem.as_deref(), Some(&b"CA"[..]));
        assert_eq!(access.identity_pem.as_deref(), Some(&b"CERT\nKEY"[..]));
        assert_eq!(access.token, Some(BearerToken::File(dir.path().join("token"))));
    }

    #[test]
    fn unknown_current_context_is_rejected() {
        let text = KUBECONFIG.replace("current-context: staging", "current-context: qa");
        let err = resolve(&text, Path::new(".")).unwrap_err();
        assert!(matches!(err, ClusterError::Client(msg) if msg.contains("'qa'")));
    }

    #[test]
    fn certificate_without_key_is_rejected() {
        let text = r#"
current-context: c
clusters:
  - name: k
    cluster:
      server: https://k:6443
contexts:
  - name: c
    context:
      cluster: k
      user: u
users:
  - name: u
    user:
      client-certificate-data: Q0VSVA==
"#;
        let err = resolve(text, Path::new(".")).unwrap_err();
        assert!(matches!(err, ClusterError::Client(_)));
    }
}
