//! Configuration Loader
//!
//! Layers defaults, an optional config file and `HTTPCACHE__*` environment
//! variables, then validates the result.

use config::{Config, Environment, File};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::SidecarConfig;
use crate::constants::ENV_PREFIX;
use crate::error::{Result, SidecarError};

/// Loads [`SidecarConfig`] from its layered sources
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    config_file: Option<PathBuf>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a config file layer. The format follows the file extension.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Override the environment prefix. Tests use this to stay isolated from
    /// the process environment.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Build, deserialize and validate the configuration
    pub fn load(&self) -> Result<SidecarConfig> {
        let mut builder = Config::builder();

        if let Some(path) = &self.config_file {
            if !path.exists() {
                return Err(SidecarError::Configuration(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            debug!("Loading configuration file: {}", path.display());
            builder = builder.add_source(File::from(path.as_path()));
        }

        let prefix = self.env_prefix.as_deref().unwrap_or(ENV_PREFIX);
        builder = builder.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config: SidecarConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        info!(
            frontend_watch = config.frontend.service.watch,
            backend_watch = config.backend.watch,
            signaller = config.signaller.enable,
            "⚙️ CONFIG: Configuration loaded"
        );
        debug!(
            "Effective configuration: {}",
            serde_json::to_string(&sanitize_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );

        Ok(config)
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }
}

/// JSON view of the configuration with secret-looking fields masked
pub fn sanitize_for_logging(config: &SidecarConfig) -> JsonValue {
    let mut value = serde_json::to_value(config).unwrap_or(JsonValue::Null);
    mask_sensitive(&mut value, &["secret", "token", "password"]);
    value
}

fn mask_sensitive(value: &mut JsonValue, patterns: &[&str]) {
    match value {
        JsonValue::Object(map) => {
            for (key, val) in map.iter_mut() {
                let key_lower = key.to_lowercase();
                if patterns.iter().any(|p| key_lower.contains(p)) && !val.is_null() {
                    *val = JsonValue::String("[MASKED]".to_string());
                } else {
                    mask_sensitive(val, patterns);
                }
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                mask_sensitive(item, patterns);
            }
        }
        _ => {}
    }
}
