//! # System Constants
//!
//! Names, paths and wire-level values shared across the sidecar.

/// Configuration naming inside the cache process
pub mod vcl {
    /// Name the cache process gives the configuration it was launched with
    pub const BOOT_CONFIG_NAME: &str = "boot";

    /// Prefix of every configuration this sidecar defines; the reload sequence number is appended
    pub const CONFIG_NAME_PREFIX: &str = "k8s-upstreamcfg-";

    /// Template name used in render error messages
    pub const TEMPLATE_NAME: &str = "vcl";

    /// Build the configuration name for reload sequence `sequence`
    pub fn config_name(sequence: u64) -> String {
        format!("{CONFIG_NAME_PREFIX}{sequence}")
    }
}

/// Template context keys handed to the configuration renderer
pub mod template_inputs {
    pub const FRONTENDS: &str = "frontends";
    pub const PRIMARY_FRONTEND: &str = "primary_frontend";
    pub const BACKENDS: &str = "backends";
    pub const PRIMARY_BACKEND: &str = "primary_backend";
}

/// Invalidation broadcaster HTTP surface
pub mod signaller {
    /// Acknowledgement body returned to every accepted invalidation request
    pub const ACK_BODY: &str = "Signal request is being broadcasted.";

    pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
}

/// Kubernetes service account defaults
pub mod kubernetes {
    pub const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
    pub const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
    pub const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
    pub const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";

    /// Pod condition status meaning the condition holds
    pub const CONDITION_TRUE: &str = "True";
}

/// Environment variable prefix for layered configuration
pub const ENV_PREFIX: &str = "HTTPCACHE";
