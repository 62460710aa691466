//! Cache process launch and supervision.
//!
//! The launcher owns the child: it terminates it when the cancellation token
//! fires and reports the exit exactly once through the [`ProcessHandle`].

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SidecarConfig;
use crate::error::{Result, SidecarError};

/// Fixed command line of the cache process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheCommand {
    pub program: String,
    pub config_file: PathBuf,
    pub secret_file: PathBuf,
    pub storage: String,
    /// `address:port` for client traffic
    pub listen: String,
    /// `address:port` for the administration port
    pub admin: String,
    /// Passthrough `-p` parameters
    pub parameters: Vec<String>,
    pub working_dir: Option<String>,
    /// Directory the process is started in
    pub current_dir: PathBuf,
}

impl CacheCommand {
    pub fn from_config(config: &SidecarConfig) -> Self {
        let varnish = &config.varnish;
        let parameters = if varnish.additional_parameters.is_empty() {
            Vec::new()
        } else {
            varnish
                .additional_parameters
                .split(',')
                .map(str::to_string)
                .collect()
        };

        Self {
            program: varnish.binary.clone(),
            config_file: varnish.config_file.clone(),
            secret_file: varnish.secret_file.clone(),
            storage: varnish.storage.clone(),
            listen: format!("{}:{}", config.frontend.address, config.frontend.port),
            admin: format!("{}:{}", config.admin.address, config.admin.port),
            parameters,
            working_dir: Some(varnish.working_dir.clone()).filter(|dir| !dir.is_empty()),
            current_dir: PathBuf::from("/"),
        }
    }

    /// `-F -f <cfg> -S <secret> -s <storage> -a <listen> -T <admin> [-p <param>]... [-n <dir>]`
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-F".to_string(),
            "-f".to_string(),
            self.config_file.display().to_string(),
            "-S".to_string(),
            self.secret_file.display().to_string(),
            "-s".to_string(),
            self.storage.clone(),
            "-a".to_string(),
            self.listen.clone(),
            "-T".to_string(),
            self.admin.clone(),
        ];

        for parameter in &self.parameters {
            args.push("-p".to_string());
            args.push(parameter.clone());
        }

        if let Some(dir) = &self.working_dir {
            args.push("-n".to_string());
            args.push(dir.clone());
        }

        args
    }
}

/// How the supervised process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own; `None` when killed by a signal
    Exited(Option<i32>),
    /// Terminated after cancellation
    Terminated,
    /// Waiting on the child failed, or the supervisor vanished
    Lost(String),
}

impl ProcessExit {
    /// Map the exit onto the controller's result.
    pub fn into_result(self) -> Result<()> {
        match self {
            ProcessExit::Exited(Some(0)) => Ok(()),
            ProcessExit::Exited(Some(code)) => Err(SidecarError::ProcessExited(format!(
                "exit status {code}"
            ))),
            ProcessExit::Exited(None) => Err(SidecarError::ProcessExited(
                "terminated by signal".to_string(),
            )),
            ProcessExit::Terminated => Err(SidecarError::Cancelled(
                "cache process terminated on shutdown".to_string(),
            )),
            ProcessExit::Lost(reason) => Err(SidecarError::ProcessExited(reason)),
        }
    }
}

/// A running cache process
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    exit: oneshot::Receiver<ProcessExit>,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>, exit: oneshot::Receiver<ProcessExit>) -> Self {
        Self { pid, exit }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Resolve once the process is gone. Cancel safe; must not be polled
    /// again after it has returned.
    pub async fn wait(&mut self) -> ProcessExit {
        match (&mut self.exit).await {
            Ok(exit) => exit,
            Err(_) => ProcessExit::Lost("process supervisor dropped".to_string()),
        }
    }
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start the process; it is terminated when `cancel` fires.
    async fn launch(&self, command: &CacheCommand, cancel: CancellationToken) -> Result<ProcessHandle>;
}

/// Launches the real binary with inherited stdout/stderr
#[derive(Debug, Clone, Default)]
pub struct TokioProcessLauncher;

impl TokioProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    async fn launch(&self, command: &CacheCommand, cancel: CancellationToken) -> Result<ProcessHandle> {
        let args = command.args();
        info!(program = %command.program, args = ?args, "🚀 CONTROLLER: Launching cache process");

        let mut cmd = Command::new(&command.program);
        cmd.args(&args).current_dir(&command.current_dir);
        supervise(cmd, cancel)
    }
}

/// Spawn `cmd` and supervise it on a background task.
pub(crate) fn supervise(mut cmd: Command, cancel: CancellationToken) -> Result<ProcessHandle> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| SidecarError::ProcessLaunch(e.to_string()))?;
    let pid = child.id();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let exit = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => ProcessExit::Exited(status.code()),
                Err(e) => ProcessExit::Lost(e.to_string()),
            },
            _ = cancel.cancelled() => {
                info!(?pid, "🛑 CONTROLLER: Terminating cache process");
                if let Err(e) = child.kill().await {
                    warn!(?pid, error = %e, "failed to terminate cache process");
                }
                ProcessExit::Terminated
            }
        };

        info!(?pid, exit = ?exit, "cache process exited");
        // nobody listening means the controller is already gone
        let _ = tx.send(exit);
    });

    Ok(ProcessHandle::new(pid, rx))
}
