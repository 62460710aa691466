//! # Template Source
//!
//! Emits the full content of the configuration template every time it
//! changes on disk. Two strategies share the [`TemplateWatcher`] contract:
//! filesystem notifications ([`NotifyTemplateWatcher`]) and mtime polling
//! ([`PollingTemplateWatcher`]). Neither emits at startup; the controller
//! loads the initial template itself.

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{ErrorReporter, Result, SidecarError};

/// A restartable source of raw template bytes
#[async_trait]
pub trait TemplateWatcher: Send {
    fn path(&self) -> &Path;

    /// Emit full template content on every change until cancelled or the
    /// receiver is dropped. Read failures go to `errors` and the watch goes on.
    async fn run(
        self: Box<Self>,
        updates: mpsc::Sender<Vec<u8>>,
        errors: ErrorReporter,
        cancel: CancellationToken,
    );
}

/// Run a boxed watcher on its own task
pub fn spawn_template_watcher(
    watcher: Box<dyn TemplateWatcher>,
    updates: mpsc::Sender<Vec<u8>>,
    errors: ErrorReporter,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(watcher.run(updates, errors, cancel))
}

/// Pick a strategy. Fails when the template cannot be read right now.
pub fn new_template_watcher(
    path: impl Into<PathBuf>,
    poll: bool,
    poll_interval: Duration,
) -> Result<Box<dyn TemplateWatcher>> {
    let path = path.into();
    if poll {
        info!(path = %path.display(), interval = ?poll_interval, "📄 TEMPLATE: Polling template for changes");
        Ok(Box::new(PollingTemplateWatcher::new(path, poll_interval)?))
    } else {
        info!(path = %path.display(), "📄 TEMPLATE: Watching template for filesystem notifications");
        Ok(Box::new(NotifyTemplateWatcher::new(path)?))
    }
}

fn ensure_readable(path: &Path) -> Result<()> {
    std::fs::File::open(path).map(|_| ()).map_err(|e| {
        SidecarError::Template(format!("template {} is not readable: {e}", path.display()))
    })
}

async fn read_template(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        SidecarError::Template(format!("failed to read template {}: {e}", path.display()))
    })
}

/// Send one update; `false` when the watcher should stop.
async fn emit(
    updates: &mpsc::Sender<Vec<u8>>,
    content: Vec<u8>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = updates.send(content) => sent.is_ok(),
    }
}

/// Filesystem notification strategy
pub struct NotifyTemplateWatcher {
    path: PathBuf,
    // dropping the watcher ends the subscription
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

impl std::fmt::Debug for NotifyTemplateWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyTemplateWatcher")
            .field("path", &self.path)
            .finish()
    }
}

impl NotifyTemplateWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        ensure_readable(&path)?;

        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            // the receiver only goes away with the watcher itself
            let _ = tx.send(event);
        })
        .map_err(|e| SidecarError::Template(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                SidecarError::Template(format!("failed to watch {}: {e}", path.display()))
            })?;

        Ok(Self {
            path,
            _watcher: watcher,
            events,
        })
    }
}

#[async_trait]
impl TemplateWatcher for NotifyTemplateWatcher {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn run(
        mut self: Box<Self>,
        updates: mpsc::Sender<Vec<u8>>,
        errors: ErrorReporter,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = self.events.recv() => event,
            };

            let event = match event {
                None => return,
                Some(Err(e)) => {
                    error!(error = %e, "template watch error");
                    errors.report(SidecarError::Template(e.to_string()));
                    continue;
                }
                Some(Ok(event)) => event,
            };

            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                continue;
            }
            debug!(kind = ?event.kind, path = %self.path.display(), "template changed");

            match read_template(&self.path).await {
                Ok(content) => {
                    if !emit(&updates, content, &cancel).await {
                        return;
                    }
                }
                Err(e) => {
                    error!(error = %e, "could not read changed template");
                    errors.report(e);
                }
            }
        }
    }
}

/// Modification-time polling strategy
#[derive(Debug)]
pub struct PollingTemplateWatcher {
    path: PathBuf,
    interval: Duration,
    last_modified: SystemTime,
}

impl PollingTemplateWatcher {
    /// Seeds the last observed mtime from the file as it is now.
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Result<Self> {
        let path = path.into();
        ensure_readable(&path)?;
        let last_modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map_err(|e| {
                SidecarError::Template(format!("cannot stat template {}: {e}", path.display()))
            })?;

        Ok(Self {
            path,
            interval,
            last_modified,
        })
    }

    async fn modified(&self) -> Result<SystemTime> {
        let metadata = tokio::fs::metadata(&self.path).await?;
        Ok(metadata.modified()?)
    }
}

#[async_trait]
impl TemplateWatcher for PollingTemplateWatcher {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn run(
        mut self: Box<Self>,
        updates: mpsc::Sender<Vec<u8>>,
        errors: ErrorReporter,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let modified = match self.modified().await {
                Ok(modified) => modified,
                Err(e) => {
                    error!(error = %e, path = %self.path.display(), "cannot stat template");
                    errors.report(e);
                    continue;
                }
            };
            if modified <= self.last_modified {
                continue;
            }

            match read_template(&self.path).await {
                Ok(content) => {
                    self.last_modified = modified;
                    debug!(path = %self.path.display(), "template modification time advanced");
                    if !emit(&updates, content, &cancel).await {
                        return;
                    }
                }
                Err(e) => {
                    error!(error = %e, "could not read changed template");
                    errors.report(e);
                }
            }
        }
    }
}
