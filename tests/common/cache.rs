//! Stand-ins for the cache process and its administration port.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use httpcache_sidecar::controller::process::{CacheCommand, ProcessExit, ProcessHandle, ProcessLauncher};
use httpcache_sidecar::{AdminConnector, AdminError, AdminSession, ConfigState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCall {
    Authenticate,
    Define { name: String, source: String },
    Use(String),
    State(String, ConfigState),
}

/// Shared log of every administration call, with overlap detection
#[derive(Default)]
pub struct AdminLog {
    calls: Mutex<Vec<AdminCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl AdminLog {
    pub fn calls(&self) -> Vec<AdminCall> {
        self.calls.lock().clone()
    }

    pub fn activated(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AdminCall::Use(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Configurations moved to the cold state, in order
    pub fn retired(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AdminCall::State(name, ConfigState::Cold) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Source of the most recently defined configuration
    pub fn last_source(&self) -> Option<String> {
        self.calls().into_iter().rev().find_map(|call| match call {
            AdminCall::Define { source, .. } => Some(source),
            _ => None,
        })
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

pub struct FakeAdminPort {
    pub log: Arc<AdminLog>,
    latency: Duration,
}

impl FakeAdminPort {
    pub fn new(latency: Duration) -> Self {
        Self {
            log: Arc::new(AdminLog::default()),
            latency,
        }
    }
}

#[async_trait]
impl AdminConnector for FakeAdminPort {
    async fn connect(&self, _address: &str) -> Result<Box<dyn AdminSession>, AdminError> {
        Ok(Box::new(FakeAdminSession {
            log: self.log.clone(),
            latency: self.latency,
        }))
    }
}

struct FakeAdminSession {
    log: Arc<AdminLog>,
    latency: Duration,
}

impl FakeAdminSession {
    async fn record(&self, call: AdminCall) {
        let now = self.log.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.log.calls.lock().push(call);
        self.log.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AdminSession for FakeAdminSession {
    async fn authenticate(&mut self, _secret: &[u8]) -> Result<(), AdminError> {
        self.record(AdminCall::Authenticate).await;
        Ok(())
    }

    async fn define_config(
        &mut self,
        name: &str,
        source: &[u8],
        _state: ConfigState,
    ) -> Result<(), AdminError> {
        self.record(AdminCall::Define {
            name: name.to_string(),
            source: String::from_utf8_lossy(source).into_owned(),
        })
        .await;
        Ok(())
    }

    async fn activate_config(&mut self, name: &str) -> Result<(), AdminError> {
        self.record(AdminCall::Use(name.to_string())).await;
        Ok(())
    }

    async fn set_config_state(&mut self, name: &str, state: ConfigState) -> Result<(), AdminError> {
        self.record(AdminCall::State(name.to_string(), state)).await;
        Ok(())
    }
}

/// Cache process that runs until cancelled or told to exit
#[derive(Default)]
pub struct FakeCacheProcess {
    launches: AtomicUsize,
    exit: Mutex<Option<oneshot::Sender<ProcessExit>>>,
}

impl FakeCacheProcess {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn exit_with(&self, exit: ProcessExit) {
        if let Some(trigger) = self.exit.lock().take() {
            let _ = trigger.send(exit);
        }
    }
}

#[async_trait]
impl ProcessLauncher for FakeCacheProcess {
    async fn launch(
        &self,
        _command: &CacheCommand,
        cancel: CancellationToken,
    ) -> httpcache_sidecar::Result<ProcessHandle> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (trigger, triggered) = oneshot::channel();
        *self.exit.lock() = Some(trigger);

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let exit = tokio::select! {
                _ = cancel.cancelled() => ProcessExit::Terminated,
                exit = triggered => exit.unwrap_or(ProcessExit::Lost("trigger dropped".into())),
            };
            let _ = tx.send(exit);
        });
        Ok(ProcessHandle::new(Some(7), rx))
    }
}
