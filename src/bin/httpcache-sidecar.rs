//! # HTTP Cache Sidecar
//!
//! Runs the endpoint reconcilers, the template source, the optional
//! invalidation broadcaster and the cache controller until the cache process
//! exits or the sidecar is asked to stop.
//!
//! ## Usage
//!
//! ```bash
//! httpcache-sidecar --config /etc/httpcache/sidecar.toml
//!
//! # environment overrides use the HTTPCACHE prefix
//! HTTPCACHE__SIGNALLER__ENABLE=true httpcache-sidecar --json-logs
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use httpcache_sidecar::config::{loader::sanitize_for_logging, WatchedServiceConfig};
use httpcache_sidecar::controller::process::TokioProcessLauncher;
use httpcache_sidecar::error::{ErrorSource, ReportedError};
use httpcache_sidecar::signaller::transport::HttpSignalDispatcher;
use httpcache_sidecar::signaller::web;
use httpcache_sidecar::watcher::spawn_template_watcher;
use httpcache_sidecar::{
    logging, new_template_watcher, CacheController, ClusterApi, ConfigLoader, ControllerInputs,
    EndpointReconciler, ErrorReporter, KubernetesClient, SharedEndpointConfig, SidecarConfig,
    SidecarError, SignalTargets, Signaller, SignallerSettings, VarnishConnector,
};

/// Snapshots and template updates buffered between producers and the controller
const UPDATE_CHANNEL_CAPACITY: usize = 16;

const ERROR_LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "httpcache-sidecar")]
#[command(about = "Keep a Varnish cache in step with its cluster")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level or filter directive, overrides the configured level
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load().context("failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json_logs {
        config.logging.json = true;
    }

    logging::init_structured_logging(&config.logging);

    info!("🚀 Starting HTTP cache sidecar...");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));
    info!(config = %sanitize_for_logging(&config), "   Effective configuration");

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let (errors, error_rx) = ErrorReporter::channel(ErrorSource::Controller);
    let error_log = tokio::spawn(log_reported_errors(error_rx));

    let outcome = run(&config, errors, cancel.clone()).await;
    cancel.cancel();
    // reporter clones held by cancelled tasks drop shortly after
    match tokio::time::timeout(ERROR_LOG_DRAIN_TIMEOUT, error_log).await {
        Ok(Err(e)) => warn!(error = %e, "error log task failed"),
        Err(_) => warn!("error log still open at shutdown"),
        Ok(Ok(())) => {}
    }

    match outcome {
        Ok(()) => {
            info!("👋 HTTP cache sidecar shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "❌ HTTP cache sidecar stopped with an error");
            Err(e.into())
        }
    }
}

async fn run(
    config: &SidecarConfig,
    errors: ErrorReporter,
    cancel: CancellationToken,
) -> Result<(), SidecarError> {
    let needs_cluster = config.frontend.service.watch || config.backend.watch;
    let api: Option<Arc<dyn ClusterApi>> = if needs_cluster {
        Some(Arc::new(KubernetesClient::from_config(&config.kubernetes)?))
    } else {
        None
    };

    let mut reconcilers = Vec::new();
    let mut inputs = ControllerInputs {
        frontend: None,
        backend: None,
        templates: None,
    };

    if let Some(api) = &api {
        if config.frontend.service.watch {
            let (rx, handle) = start_reconciler(
                api.clone(),
                &config.frontend.service,
                config,
                errors.for_source(ErrorSource::Frontend),
                cancel.clone(),
            );
            inputs.frontend = Some(rx);
            reconcilers.push(handle);
        }
        if config.backend.watch {
            let (rx, handle) = start_reconciler(
                api.clone(),
                &config.backend,
                config,
                errors.for_source(ErrorSource::Backend),
                cancel.clone(),
            );
            inputs.backend = Some(rx);
            reconcilers.push(handle);
        }
    }

    let template_watcher = new_template_watcher(
        &config.varnish.vcl_template,
        config.varnish.vcl_template_poll,
        config.varnish.poll_interval(),
    )?;
    let (template_tx, template_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
    inputs.templates = Some(template_rx);
    let template_task = spawn_template_watcher(
        template_watcher,
        template_tx,
        errors.for_source(ErrorSource::Template),
        cancel.clone(),
    );

    let mut controller = CacheController::from_config(
        config,
        Arc::new(VarnishConnector::new()),
        Arc::new(TokioProcessLauncher::new()),
        errors.for_source(ErrorSource::Controller),
    )?;

    let mut server = None;
    if config.signaller.enable {
        let targets = SignalTargets::new();
        let dispatcher = Arc::new(HttpSignalDispatcher::new(config.signaller.request_timeout())?);
        let signaller = Arc::new(Signaller::start(
            SignallerSettings::from_config(&config.signaller),
            targets.clone(),
            dispatcher,
            errors.for_source(ErrorSource::Signaller),
            cancel.clone(),
        ));
        let listener = web::bind(&config.signaller.bind_address()).await?;
        server = Some(tokio::spawn(web::serve(signaller, listener, cancel.clone())));
        controller = controller.with_signal_targets(targets);
    }
    drop(errors);

    let controller_result = controller.run(inputs, cancel.clone()).await;
    cancel.cancel();

    let mut fatal = None;
    for handle in reconcilers {
        if let Some(e) = join_result(handle.await, "endpoint reconciler") {
            fatal.get_or_insert(e);
        }
    }
    if let Err(e) = template_task.await {
        warn!(error = %e, "template watcher task failed");
    }
    if let Some(server) = server {
        if let Some(e) = join_result(server.await, "signaller server") {
            warn!(error = %e, "signaller server stopped with an error");
        }
    }

    // a reconciler that failed at startup is what cancelled the controller
    if let Some(e) = fatal {
        return Err(e);
    }
    match controller_result {
        Ok(()) | Err(SidecarError::Cancelled(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Spawn a reconciler whose fatal error cancels the whole sidecar.
fn start_reconciler(
    api: Arc<dyn ClusterApi>,
    service: &WatchedServiceConfig,
    config: &SidecarConfig,
    errors: ErrorReporter,
    cancel: CancellationToken,
) -> (
    mpsc::Receiver<SharedEndpointConfig>,
    JoinHandle<Result<(), SidecarError>>,
) {
    let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
    let source = errors.source();
    let reconciler = EndpointReconciler::new(api, service, config.kubernetes.retry_backoff());
    let inner = reconciler.spawn(tx, errors, cancel.clone());

    let handle = tokio::spawn(async move {
        let result = match inner.await {
            Ok(result) => result,
            Err(e) => Err(SidecarError::Io(format!("{source} reconciler task failed: {e}"))),
        };
        if let Err(e) = &result {
            error!(%source, error = %e, "❌ RECONCILER: Stopped with a fatal error, shutting down");
            cancel.cancel();
        }
        result
    });
    (rx, handle)
}

fn join_result(
    joined: Result<Result<(), SidecarError>, tokio::task::JoinError>,
    task: &str,
) -> Option<SidecarError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(SidecarError::Io(format!("{task} task failed: {e}"))),
    }
}

/// Fan-in logger for the side error path
async fn log_reported_errors(mut rx: mpsc::UnboundedReceiver<ReportedError>) {
    while let Some(ReportedError { source, error }) = rx.recv().await {
        if error.is_transient() {
            warn!(%source, error = %error, "⚠️ Reported error");
        } else {
            error!(%source, error = %error, "❌ Reported error");
        }
    }
}

/// Cancel on Ctrl+C or SIGTERM
async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
        _ = cancel.cancelled() => return,
    }

    info!("🛑 Shutdown signal received, stopping cache and sidecar");
    cancel.cancel();
}
