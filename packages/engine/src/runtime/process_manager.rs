// packages/engine/src/runtime/process_manager.rs
//! Process manager for spawning and stopping worker processes
//!
//! A worker process is the engine binary started as `<exe> worker
//! --worker-id <id>`. Its stdin/stdout carry the worker protocol; stderr is
//! inherited so worker logs reach the host's log stream.

use crate::utils::errors::{EngineError, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::debug;

/// Configuration for spawning a worker process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Executable to run; defaults to the current binary
    pub command: Option<PathBuf>,

    /// Worker identifier passed on the command line
    pub worker_id: String,

    /// Environment variables
    pub env_vars: Vec<(String, String)>,
}

impl SpawnConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            command: None,
            worker_id: worker_id.into(),
            env_vars: vec![],
        }
    }
}

/// Spawns and stops worker processes
#[derive(Debug, Clone)]
pub struct ProcessManager {
    /// Time between SIGTERM and SIGKILL
    kill_grace: Duration,
}

impl ProcessManager {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    fn executable(config: &SpawnConfig) -> Result<PathBuf> {
        match &config.command {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(|e| {
                EngineError::Infrastructure(format!("cannot locate worker executable: {}", e))
            }),
        }
    }

    /// Spawn a new worker process
    pub fn spawn(&self, config: &SpawnConfig) -> Result<Child> {
        let executable = Self::executable(config)?;
        debug!("Spawning worker {} from {:?}", config.worker_id, executable);

        let mut command = Command::new(executable);
        command
            .arg("worker")
            .arg("--worker-id")
            .arg(&config.worker_id)
            .envs(config.env_vars.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            EngineError::Infrastructure(format!("Failed to spawn worker process: {}", e))
        })?;

        debug!("Worker {} spawned with PID: {:?}", config.worker_id, child.id());
        Ok(child)
    }

    /// SIGTERM, then SIGKILL if the process outlives the grace period
    pub async fn terminate(&self, child: &mut Child) -> Result<()> {
        let Some(pid) = child.id() else {
            // Already reaped
            return Ok(());
        };
        let pid = Pid::from_raw(pid as i32);

        debug!("Sending SIGTERM to PID {}", pid);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            debug!("SIGTERM to PID {} failed: {}", pid, e);
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Process {} exited with status: {}", pid, status);
                Ok(())
            }
            Ok(Err(e)) => Err(EngineError::Io(e)),
            Err(_) => {
                debug!("Process still alive, sending SIGKILL to PID {}", pid);
                child.kill().await.map_err(EngineError::Io)
            }
        }
    }

    /// Check if a process is running
    pub fn is_running(pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_terminate_stops_process() {
        let manager = ProcessManager::new(Duration::from_millis(200));
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert!(ProcessManager::is_running(pid));

        manager.terminate(&mut child).await.unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_spawn_reports_missing_executable() {
        let manager = ProcessManager::default();
        let config = SpawnConfig {
            command: Some(PathBuf::from("/nonexistent/fnrt-worker")),
            ..SpawnConfig::new("worker-1")
        };
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt.block_on(async { manager.spawn(&config).map(|_| ()) }).unwrap_err();
        assert!(matches!(err, EngineError::Infrastructure(_)));
    }
}
