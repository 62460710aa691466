//! Error types for the sidecar.
//!
//! [`SidecarError`] is the crate-wide error. Narrower errors for the two external
//! collaborators ([`AdminError`] for the administration protocol, [`ClusterError`]
//! for the membership API) convert into it so `?` works across module seams.
//!
//! Errors that must not stop the component producing them travel on the side
//! error path instead: an [`ErrorReporter`] handle that the entrypoint drains
//! and logs.

use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SidecarError {
    /// Setup defects: unresolvable port names, malformed templates, bad settings.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Watch streams, admin port, outbound HTTP. Always retried.
    #[error("Connectivity error: {0}")]
    Connectivity(String),
    /// Authentication, compile or activation failure on the admin channel.
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Render error: {0}")]
    Render(String),
    #[error("Template error: {0}")]
    Template(String),
    #[error("Failed to launch cache process: {0}")]
    ProcessLaunch(String),
    #[error("Cache process exited: {0}")]
    ProcessExited(String),
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl SidecarError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SidecarError::Connectivity(_) | SidecarError::Io(_))
    }
}

impl From<std::io::Error> for SidecarError {
    fn from(error: std::io::Error) -> Self {
        SidecarError::Io(error.to_string())
    }
}

impl From<config::ConfigError> for SidecarError {
    fn from(error: config::ConfigError) -> Self {
        SidecarError::Configuration(error.to_string())
    }
}

impl From<minijinja::Error> for SidecarError {
    fn from(error: minijinja::Error) -> Self {
        SidecarError::Render(error.to_string())
    }
}

impl From<AdminError> for SidecarError {
    fn from(error: AdminError) -> Self {
        match error {
            AdminError::Io(msg) => SidecarError::Connectivity(msg),
            other => SidecarError::Protocol(other.to_string()),
        }
    }
}

impl From<ClusterError> for SidecarError {
    fn from(error: ClusterError) -> Self {
        match error {
            ClusterError::PortNotFound { .. } => SidecarError::Configuration(error.to_string()),
            other => SidecarError::Connectivity(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SidecarError>;

/// Administration protocol failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminError {
    #[error("admin connection failed: {0}")]
    Io(String),
    #[error("malformed admin response: {0}")]
    Malformed(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("configuration {name} failed to compile: {message}")]
    Compile { name: String, message: String },
    #[error("admin command `{command}` failed with status {status}: {message}")]
    Command {
        command: String,
        status: u16,
        message: String,
    },
}

impl From<std::io::Error> for AdminError {
    fn from(error: std::io::Error) -> Self {
        AdminError::Io(error.to_string())
    }
}

/// Membership API failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("watch for service '{service}' could not be established: {reason}")]
    WatchFailed { service: String, reason: String },
    #[error("watch stream broken: {0}")]
    StreamBroken(String),
    #[error("workload '{name}' lookup failed: {reason}")]
    LookupFailed { name: String, reason: String },
    #[error("port '{port_name}' not found in endpoint list of service '{service}'")]
    PortNotFound { service: String, port_name: String },
    #[error("cluster client error: {0}")]
    Client(String),
}

/// Component a reported error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    Frontend,
    Backend,
    Template,
    Controller,
    Signaller,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorSource::Frontend => "frontend",
            ErrorSource::Backend => "backend",
            ErrorSource::Template => "template",
            ErrorSource::Controller => "controller",
            ErrorSource::Signaller => "signaller",
        };
        f.write_str(name)
    }
}

/// A non-fatal error plus where it came from.
#[derive(Debug, Clone)]
pub struct ReportedError {
    pub source: ErrorSource,
    pub error: SidecarError,
}

/// Cloneable handle onto the side error path.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    source: ErrorSource,
    sender: mpsc::UnboundedSender<ReportedError>,
}

impl ErrorReporter {
    /// Create a reporter channel. The receiver belongs to whoever logs errors.
    pub fn channel(source: ErrorSource) -> (Self, mpsc::UnboundedReceiver<ReportedError>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { source, sender }, receiver)
    }

    /// Same channel, different origin tag.
    pub fn for_source(&self, source: ErrorSource) -> Self {
        Self {
            source,
            sender: self.sender.clone(),
        }
    }

    pub fn source(&self) -> ErrorSource {
        self.source
    }

    pub fn report(&self, error: SidecarError) {
        let reported = ReportedError {
            source: self.source,
            error,
        };
        if let Err(mpsc::error::SendError(lost)) = self.sender.send(reported) {
            // receiver gone during shutdown
            warn!(source = %lost.source, error = %lost.error, "error reporter closed");
        }
    }
}
