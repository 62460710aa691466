#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # HTTP Cache Sidecar
//!
//! Runs next to a Varnish cache inside a cluster and keeps it in step with the
//! cluster around it.
//!
//! ## Overview
//!
//! - Watches the frontend service (the cache instances themselves) and the
//!   backend service, and turns raw membership events into stable snapshots.
//! - Renders the cache configuration from a template and those snapshots,
//!   launches the cache, and hot-swaps the configuration over the
//!   administration port whenever membership or the template changes.
//! - Accepts invalidation requests over HTTP and replicates them to every
//!   cache instance with bounded retries.
//!
//! ## Module Organization
//!
//! - [`watcher`] - Membership model, endpoint reconciler, template source
//! - [`cluster`] - Membership API boundary and Kubernetes REST client
//! - [`controller`] - Cache process bootstrap, supervision and reload loop
//! - [`admin`] - Administration protocol client
//! - [`signaller`] - Invalidation broadcaster
//! - [`config`] - Layered configuration
//! - [`error`] - Error taxonomy and the side error path
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use httpcache_sidecar::config::ConfigLoader;
//!
//! # fn example() -> httpcache_sidecar::Result<()> {
//! let config = ConfigLoader::new().with_file("/etc/httpcache/sidecar.toml").load()?;
//! httpcache_sidecar::logging::init_structured_logging(&config.logging);
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod logging;
pub mod signaller;
pub mod watcher;

pub use admin::{AdminConnector, AdminSession, ConfigState, VarnishConnector};
pub use cluster::{ClusterApi, KubernetesClient, MembershipEvent, Readiness, ServiceEndpoints};
pub use config::{ConfigLoader, SidecarConfig};
pub use controller::{CacheController, ControllerInputs, ControllerSettings, ControllerState};
pub use error::{
    AdminError, ClusterError, ErrorReporter, ErrorSource, ReportedError, Result, SidecarError,
};
pub use signaller::{SignalTargets, Signaller, SignallerSettings};
pub use watcher::{
    new_template_watcher, Endpoint, EndpointConfig, EndpointList, EndpointReconciler,
    SharedEndpointConfig, TemplateWatcher,
};
