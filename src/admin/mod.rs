//! # Administration Protocol
//!
//! Control channel of the cache process. The controller only depends on the
//! [`AdminConnector`] / [`AdminSession`] seam; [`varnish`] speaks the actual
//! CLI protocol over TCP.

pub mod varnish;

use async_trait::async_trait;
use std::fmt;

use crate::error::AdminError;

pub use varnish::VarnishConnector;

/// Lifecycle state of a named configuration inside the cache process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigState {
    /// Let the cache decide (warm while in use)
    Auto,
    Warm,
    /// Inactive, may be reclaimed
    Cold,
}

impl ConfigState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigState::Auto => "auto",
            ConfigState::Warm => "warm",
            ConfigState::Cold => "cold",
        }
    }
}

impl fmt::Display for ConfigState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens administration sessions
#[async_trait]
pub trait AdminConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn AdminSession>, AdminError>;
}

/// One open, possibly unauthenticated, administration connection
#[async_trait]
pub trait AdminSession: Send {
    /// Answer the connection challenge with the shared secret
    async fn authenticate(&mut self, secret: &[u8]) -> Result<(), AdminError>;

    /// Compile and load `source` under `name`
    async fn define_config(
        &mut self,
        name: &str,
        source: &[u8],
        state: ConfigState,
    ) -> Result<(), AdminError>;

    /// Switch live traffic to `name`
    async fn activate_config(&mut self, name: &str) -> Result<(), AdminError>;

    async fn set_config_state(&mut self, name: &str, state: ConfigState) -> Result<(), AdminError>;
}
