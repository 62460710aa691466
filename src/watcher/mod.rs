//! Change sources feeding the cache controller: cluster membership
//! ([`reconciler`]) and the configuration template ([`template`]).

pub mod endpoints;
pub mod reconciler;
pub mod template;

pub use endpoints::{Endpoint, EndpointConfig, EndpointList, EndpointProbe, SharedEndpointConfig};
pub use reconciler::{EndpointReconciler, ReconcileOutcome};
pub use template::{
    new_template_watcher, spawn_template_watcher, NotifyTemplateWatcher, PollingTemplateWatcher,
    TemplateWatcher,
};
