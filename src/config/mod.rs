//! # Sidecar Configuration
//!
//! Layered configuration for the sidecar: built-in defaults, an optional config
//! file, then `HTTPCACHE__*` environment variables. See [`loader::ConfigLoader`].
//!
//! Every section is `#[serde(default)]`, so a config file only has to name the
//! values it changes.
//!
//! ```rust
//! use httpcache_sidecar::config::SidecarConfig;
//!
//! let config = SidecarConfig::default();
//! assert_eq!(config.admin.port, 6083);
//! assert_eq!(config.signaller.workers_count, 1);
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants;
use crate::error::{Result, SidecarError};

pub use loader::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Membership API connection settings
    pub kubernetes: KubernetesConfig,

    /// Frontend service: the cache instances themselves, also the fan-out targets
    pub frontend: FrontendConfig,

    /// Backend service the cache forwards to
    pub backend: WatchedServiceConfig,

    /// Administration port of the cache process
    pub admin: AdminConfig,

    /// Cache process launch and template settings
    pub varnish: VarnishConfig,

    /// Invalidation broadcaster
    pub signaller: SignallerConfig,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Explicit API server base URL; in-cluster discovery when unset
    pub api_server: Option<String>,
    /// Kubeconfig for running outside the cluster; its current context is used
    pub kubeconfig: Option<PathBuf>,
    pub token_file: PathBuf,
    pub ca_file: PathBuf,
    /// Delay before re-establishing a broken watch
    pub retry_backoff_ms: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_server: None,
            kubeconfig: None,
            token_file: PathBuf::from(constants::kubernetes::SERVICE_ACCOUNT_TOKEN),
            ca_file: PathBuf::from(constants::kubernetes::SERVICE_ACCOUNT_CA),
            retry_backoff_ms: 30_000,
        }
    }
}

impl KubernetesConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// A watched cluster service
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchedServiceConfig {
    pub watch: bool,
    pub namespace: String,
    pub service: String,
    pub port_name: String,
}

impl Default for WatchedServiceConfig {
    fn default() -> Self {
        Self {
            watch: true,
            namespace: "default".to_string(),
            service: String::new(),
            port_name: "http".to_string(),
        }
    }
}

impl WatchedServiceConfig {
    fn validate(&self, section: &str) -> Result<()> {
        if !self.watch {
            return Ok(());
        }
        if self.service.trim().is_empty() {
            return Err(SidecarError::Configuration(format!(
                "{section}.service must be set when {section}.watch is enabled"
            )));
        }
        if self.port_name.trim().is_empty() {
            return Err(SidecarError::Configuration(format!(
                "{section}.port_name must be set when {section}.watch is enabled"
            )));
        }
        Ok(())
    }
}

/// Frontend watch plus the listen address handed to the cache process
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FrontendConfig {
    #[serde(flatten)]
    pub service: WatchedServiceConfig,
    pub address: String,
    pub port: u16,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            service: WatchedServiceConfig::default(),
            address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    pub address: String,
    pub port: u16,
    /// Interval between admin port probes during bootstrap
    pub probe_interval_ms: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 6083,
            probe_interval_ms: 1000,
        }
    }
}

impl AdminConfig {
    /// Address the sidecar dials; the cache always runs in the same pod.
    pub fn local_endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VarnishConfig {
    /// Cache process executable
    pub binary: String,
    pub secret_file: PathBuf,
    pub storage: String,
    /// Comma separated `-p` parameters
    pub additional_parameters: String,
    pub working_dir: String,
    pub vcl_template: PathBuf,
    /// Poll the template instead of subscribing to file notifications
    pub vcl_template_poll: bool,
    pub vcl_template_poll_interval_ms: u64,
    /// Where the initial rendering is written before launch
    pub config_file: PathBuf,
}

impl Default for VarnishConfig {
    fn default() -> Self {
        Self {
            binary: "varnishd".to_string(),
            secret_file: PathBuf::from("/etc/varnish/secret"),
            storage: "file,/tmp/varnish-data,1G".to_string(),
            additional_parameters: String::new(),
            working_dir: String::new(),
            vcl_template: PathBuf::from("/etc/varnish/default.vcl.tmpl"),
            vcl_template_poll: false,
            vcl_template_poll_interval_ms: 1000,
            config_file: PathBuf::from("/tmp/vcl"),
        }
    }
}

impl VarnishConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.vcl_template_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SignallerConfig {
    pub enable: bool,
    pub address: String,
    pub port: u16,
    pub workers_count: usize,
    /// Total delivery attempts per signal, first one included
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Bound of the shared work queue
    pub queue_capacity: usize,
    pub endpoint_scheme: String,
    pub request_timeout_ms: u64,
}

impl Default for SignallerConfig {
    fn default() -> Self {
        Self {
            enable: false,
            address: "0.0.0.0".to_string(),
            port: 8090,
            workers_count: 1,
            max_retries: 5,
            retry_backoff_ms: 30_000,
            queue_capacity: 1024,
            endpoint_scheme: "http".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl SignallerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl SidecarConfig {
    /// Reject settings the sidecar cannot start with.
    pub fn validate(&self) -> Result<()> {
        self.frontend.service.validate("frontend")?;
        self.backend.validate("backend")?;

        if self.varnish.secret_file.as_os_str().is_empty() {
            return Err(SidecarError::Configuration(
                "varnish.secret_file must be set".to_string(),
            ));
        }
        if self.varnish.vcl_template.as_os_str().is_empty() {
            return Err(SidecarError::Configuration(
                "varnish.vcl_template must be set".to_string(),
            ));
        }
        if self.varnish.vcl_template_poll && self.varnish.vcl_template_poll_interval_ms == 0 {
            return Err(SidecarError::Configuration(
                "varnish.vcl_template_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.admin.probe_interval_ms == 0 {
            return Err(SidecarError::Configuration(
                "admin.probe_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.signaller.enable {
            if self.signaller.workers_count == 0 {
                return Err(SidecarError::Configuration(
                    "signaller.workers_count must be at least 1".to_string(),
                ));
            }
            if self.signaller.max_retries == 0 {
                return Err(SidecarError::Configuration(
                    "signaller.max_retries must be at least 1".to_string(),
                ));
            }
            if self.signaller.queue_capacity == 0 {
                return Err(SidecarError::Configuration(
                    "signaller.queue_capacity must be at least 1".to_string(),
                ));
            }
        }

        Ok(())
    }
}
