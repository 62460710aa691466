//! # Cache Controller
//!
//! Owns the cache process and its live configuration. After bootstrap a
//! single dispatcher reacts to template, frontend and backend updates one at
//! a time; every reaction runs one reload sequence to completion before the
//! next event is taken, so configuration names and retirement never race.
//!
//! ## Bootstrap
//!
//! `AwaitingFrontend → AwaitingBackend → Rendering → Launching →
//! AwaitingAdminPort → Serving`
//!
//! ## Reload sequence
//!
//! render → connect (or reuse) and authenticate → define `k8s-upstreamcfg-<i>`
//! → activate it → cold the previous configuration (best effort) → record it
//! as active.

pub mod process;
pub mod render;


use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::admin::{AdminConnector, AdminSession, ConfigState};
use crate::config::SidecarConfig;
use crate::constants::vcl;
use crate::error::{AdminError, ErrorReporter, Result, SidecarError};
use crate::signaller::SignalTargets;
use crate::watcher::{EndpointConfig, SharedEndpointConfig};

use self::process::{CacheCommand, ProcessExit, ProcessHandle, ProcessLauncher};
use self::render::VclTemplate;

pub use self::process::TokioProcessLauncher;

/// Lifecycle of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    AwaitingFrontend,
    AwaitingBackend,
    Rendering,
    Launching,
    AwaitingAdminPort,
    Serving,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::AwaitingFrontend => "awaiting_frontend",
            ControllerState::AwaitingBackend => "awaiting_backend",
            ControllerState::Rendering => "rendering",
            ControllerState::Launching => "launching",
            ControllerState::AwaitingAdminPort => "awaiting_admin_port",
            ControllerState::Serving => "serving",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Settings the controller needs from [`SidecarConfig`]
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Where the administration port is dialled
    pub admin_endpoint: String,
    pub admin_probe_interval: Duration,
    /// File the initial rendering is written to before launch
    pub config_file: PathBuf,
    pub command: CacheCommand,
}

impl ControllerSettings {
    pub fn from_config(config: &SidecarConfig) -> Self {
        Self {
            admin_endpoint: config.admin.local_endpoint(),
            admin_probe_interval: config.admin.probe_interval(),
            config_file: config.varnish.config_file.clone(),
            command: CacheCommand::from_config(config),
        }
    }
}

/// Update streams feeding the dispatcher. A `None` watch is disabled.
#[derive(Debug)]
pub struct ControllerInputs {
    pub frontend: Option<mpsc::Receiver<SharedEndpointConfig>>,
    pub backend: Option<mpsc::Receiver<SharedEndpointConfig>>,
    pub templates: Option<mpsc::Receiver<Vec<u8>>>,
}

#[derive(Debug)]
enum ControllerEvent {
    Template(Vec<u8>),
    Frontend(SharedEndpointConfig),
    Backend(SharedEndpointConfig),
}

async fn next_from<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl ControllerInputs {
    /// Next event from any open input. Closed inputs are dropped; with all
    /// inputs closed this never resolves.
    async fn next_event(&mut self) -> ControllerEvent {
        loop {
            tokio::select! {
                update = next_from(&mut self.templates) => match update {
                    Some(bytes) => return ControllerEvent::Template(bytes),
                    None => {
                        warn!("template updates closed");
                        self.templates = None;
                    }
                },
                update = next_from(&mut self.frontend) => match update {
                    Some(snapshot) => return ControllerEvent::Frontend(snapshot),
                    None => {
                        warn!("frontend updates closed");
                        self.frontend = None;
                    }
                },
                update = next_from(&mut self.backend) => match update {
                    Some(snapshot) => return ControllerEvent::Backend(snapshot),
                    None => {
                        warn!("backend updates closed");
                        self.backend = None;
                    }
                },
            }
        }
    }
}

/// An open administration session and whether it passed authentication
struct AdminLink {
    session: Box<dyn AdminSession>,
    authenticated: bool,
}

impl AdminLink {
    async fn open(connector: &dyn AdminConnector, address: &str) -> std::result::Result<Self, AdminError> {
        Ok(Self {
            session: connector.connect(address).await?,
            authenticated: false,
        })
    }

    /// Authenticate if needed, then define `name` and switch to it.
    async fn apply(
        &mut self,
        secret: &[u8],
        name: &str,
        rendered: &[u8],
    ) -> std::result::Result<(), AdminError> {
        if !self.authenticated {
            self.session.authenticate(secret).await?;
            self.authenticated = true;
        }
        self.session
            .define_config(name, rendered, ConfigState::Auto)
            .await?;
        self.session.activate_config(name).await
    }
}

/// The cache process supervisor and configuration reloader
pub struct CacheController {
    settings: ControllerSettings,
    /// Shared secret for the administration port
    secret: Vec<u8>,
    template: VclTemplate,
    connector: Arc<dyn AdminConnector>,
    launcher: Arc<dyn ProcessLauncher>,
    /// Fan-out targets refreshed from frontend snapshots
    signal_targets: Option<SignalTargets>,
    errors: ErrorReporter,
    frontend: SharedEndpointConfig,
    backend: SharedEndpointConfig,
    /// Name of the configuration currently serving traffic
    active_config: String,
    /// Reload sequence counter; the first reload uses 1
    sequence: u64,
    link: Option<AdminLink>,
    state: watch::Sender<ControllerState>,
}

impl fmt::Debug for CacheController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheController")
            .field("settings", &self.settings)
            .field("active_config", &self.active_config)
            .field("sequence", &self.sequence)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl CacheController {
    pub fn new(
        settings: ControllerSettings,
        secret: Vec<u8>,
        template: VclTemplate,
        connector: Arc<dyn AdminConnector>,
        launcher: Arc<dyn ProcessLauncher>,
        errors: ErrorReporter,
    ) -> Self {
        let (state, _) = watch::channel(ControllerState::AwaitingFrontend);
        Self {
            settings,
            secret,
            template,
            connector,
            launcher,
            signal_targets: None,
            errors,
            frontend: Arc::new(EndpointConfig::empty()),
            backend: Arc::new(EndpointConfig::empty()),
            active_config: vcl::BOOT_CONFIG_NAME.to_string(),
            sequence: 0,
            link: None,
            state,
        }
    }

    /// Read the secret and the initial template named in `config`.
    pub fn from_config(
        config: &SidecarConfig,
        connector: Arc<dyn AdminConnector>,
        launcher: Arc<dyn ProcessLauncher>,
        errors: ErrorReporter,
    ) -> Result<Self> {
        let secret = std::fs::read(&config.varnish.secret_file).map_err(|e| {
            SidecarError::Configuration(format!(
                "cannot read secret file {}: {e}",
                config.varnish.secret_file.display()
            ))
        })?;
        let template = VclTemplate::from_file(&config.varnish.vcl_template)?;

        Ok(Self::new(
            ControllerSettings::from_config(config),
            secret,
            template,
            connector,
            launcher,
            errors,
        ))
    }

    /// Keep the broadcaster's targets in step with frontend snapshots.
    pub fn with_signal_targets(mut self, targets: SignalTargets) -> Self {
        self.signal_targets = Some(targets);
        self
    }

    /// Observe lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ControllerState) {
        debug!(from = %*self.state.borrow(), to = %next, "controller state transition");
        self.state.send_replace(next);
    }

    /// Bootstrap, then dispatch until the cache process exits or `cancel`
    /// fires. The process exit is the result.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut inputs: ControllerInputs, cancel: CancellationToken) -> Result<()> {
        info!("🚀 CONTROLLER: Waiting for initial configuration before starting cache");

        let result = match self.bootstrap(&mut inputs, &cancel).await {
            Ok(mut process) => self.dispatch(&mut inputs, &mut process, &cancel).await,
            Err(e) => Err(e),
        };

        self.transition(ControllerState::Stopped);
        match &result {
            Ok(()) => info!("✅ CONTROLLER: Cache process exited cleanly"),
            Err(SidecarError::Cancelled(reason)) => info!(%reason, "🛑 CONTROLLER: Stopped"),
            Err(e) => error!(error = %e, "❌ CONTROLLER: Stopped"),
        }
        result
    }

    async fn bootstrap(
        &mut self,
        inputs: &mut ControllerInputs,
        cancel: &CancellationToken,
    ) -> Result<ProcessHandle> {
        self.transition(ControllerState::AwaitingFrontend);
        if let Some(rx) = inputs.frontend.as_mut() {
            self.frontend = first_snapshot(rx, "frontend", cancel).await?;
            if let Some(targets) = &self.signal_targets {
                targets.replace(self.frontend.clone());
            }
        }

        self.transition(ControllerState::AwaitingBackend);
        if let Some(rx) = inputs.backend.as_mut() {
            self.backend = first_snapshot(rx, "backend", cancel).await?;
        }

        self.transition(ControllerState::Rendering);
        info!(
            frontends = self.frontend.endpoints.len(),
            backends = self.backend.endpoints.len(),
            "📝 CONTROLLER: Creating initial configuration"
        );
        let rendered = self.template.render(&self.frontend, &self.backend)?;
        tokio::fs::write(&self.settings.config_file, &rendered)
            .await
            .map_err(|e| {
                SidecarError::Io(format!(
                    "cannot write {}: {e}",
                    self.settings.config_file.display()
                ))
            })?;

        self.transition(ControllerState::Launching);
        let mut process = self
            .launcher
            .launch(&self.settings.command, cancel.clone())
            .await?;

        self.transition(ControllerState::AwaitingAdminPort);
        tokio::select! {
            reachable = self.wait_for_admin_port(cancel) => reachable?,
            exit = process.wait() => {
                return Err(match exit {
                    ProcessExit::Terminated => SidecarError::Cancelled(
                        "cache process terminated before the admin port became reachable".to_string(),
                    ),
                    other => SidecarError::ProcessExited(format!(
                        "cache process exited before the admin port became reachable: {other:?}"
                    )),
                });
            }
        }

        info!(admin = %self.settings.admin_endpoint, pid = ?process.pid(), "✅ CONTROLLER: Cache process is serving");
        Ok(process)
    }

    /// Dial the admin port every probe interval until it answers. The first
    /// session is kept for the first reload.
    async fn wait_for_admin_port(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.settings.admin_probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SidecarError::Cancelled(
                        "shutdown requested while waiting for the admin port".to_string(),
                    ));
                }
                _ = ticker.tick() => {}
            }

            let attempt = tokio::select! {
                _ = cancel.cancelled() => continue,
                attempt = self.connector.connect(&self.settings.admin_endpoint) => attempt,
            };

            match attempt {
                Ok(session) => {
                    self.link = Some(AdminLink {
                        session,
                        authenticated: false,
                    });
                    return Ok(());
                }
                Err(e) => {
                    info!(admin = %self.settings.admin_endpoint, error = %e, "admin port not reachable yet");
                }
            }
        }
    }

    async fn dispatch(
        &mut self,
        inputs: &mut ControllerInputs,
        process: &mut ProcessHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.transition(ControllerState::Serving);

        loop {
            let event = tokio::select! {
                biased;
                exit = process.wait() => return exit.into_result(),
                _ = cancel.cancelled() => break,
                event = inputs.next_event() => event,
            };

            self.sequence += 1;
            if let Err(e) = self.handle(event).await {
                warn!(sequence = self.sequence, error = %e, "⚠️ CONTROLLER: Reload failed");
                self.errors.report(e);
            }
        }

        info!("🛑 CONTROLLER: Shutdown requested, waiting for cache process to exit");
        process.wait().await.into_result()
    }

    async fn handle(&mut self, event: ControllerEvent) -> Result<()> {
        match event {
            ControllerEvent::Template(bytes) => {
                info!("📄 CONTROLLER: Configuration template was updated");
                self.template = VclTemplate::from_bytes(&bytes)?;
            }
            ControllerEvent::Frontend(snapshot) => {
                info!(endpoints = snapshot.endpoints.len(), "received new frontend configuration");
                self.frontend = snapshot;
                if let Some(targets) = &self.signal_targets {
                    targets.replace(self.frontend.clone());
                }
            }
            ControllerEvent::Backend(snapshot) => {
                info!(endpoints = snapshot.endpoints.len(), "received new backend configuration");
                self.backend = snapshot;
            }
        }

        self.reload().await
    }

    /// One reload sequence for the current sequence number.
    async fn reload(&mut self) -> Result<()> {
        let name = vcl::config_name(self.sequence);
        let rendered = self.template.render(&self.frontend, &self.backend)?;
        debug!(config_name = %name, bytes = rendered.len(), "rendered new configuration");

        // a session that failed in any way is not put back
        let connector = self.connector.as_ref();
        let address = self.settings.admin_endpoint.as_str();
        let mut link = match self.link.take() {
            Some(mut reused) => match reused.apply(&self.secret, &name, &rendered).await {
                Ok(()) => reused,
                Err(AdminError::Io(reason)) => {
                    debug!(config_name = %name, %reason, "reused admin session is gone, reconnecting");
                    let mut fresh = AdminLink::open(connector, address).await?;
                    fresh.apply(&self.secret, &name, &rendered).await?;
                    fresh
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                let mut fresh = AdminLink::open(connector, address).await?;
                fresh.apply(&self.secret, &name, &rendered).await?;
                fresh
            }
        };

        let keep_link = match link
            .session
            .set_config_state(&self.active_config, ConfigState::Cold)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(config_name = %self.active_config, error = %e, "error while changing state of previous configuration");
                !matches!(e, AdminError::Io(_))
            }
        };

        info!(config_name = %name, previous = %self.active_config, "🔄 CONTROLLER: Activated new configuration");
        self.active_config = name;
        if keep_link {
            self.link = Some(link);
        }
        Ok(())
    }
}

async fn first_snapshot(
    rx: &mut mpsc::Receiver<SharedEndpointConfig>,
    watch: &str,
    cancel: &CancellationToken,
) -> Result<SharedEndpointConfig> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SidecarError::Cancelled(format!(
            "shutdown requested while waiting for the first {watch} snapshot"
        ))),
        snapshot = rx.recv() => snapshot.ok_or_else(|| {
            SidecarError::Configuration(format!("{watch} watch ended before the first snapshot"))
        }),
    }
}
