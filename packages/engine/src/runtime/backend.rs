// packages/engine/src/runtime/backend.rs
//! Worker backends
//!
//! A backend starts workers; a [`WorkerHandle`] is the pool's view of one
//! running worker. Two implementations:
//!
//! - [`LocalBackend`]: workers are tasks inside the host process, each with
//!   its own executor and staging tracker. Used in tests and single-node
//!   deployments.
//! - [`ProcessBackend`]: workers are child processes of the engine binary
//!   (`fnrt-engine worker`), confined with cgroups and driven over the line
//!   protocol in [`crate::runtime::protocol`].

use crate::runtime::dependencies::DependencyResolver;
use crate::runtime::isolation::{CgroupLimiter, ProcessLimits};
use crate::runtime::process_manager::{ProcessManager, SpawnConfig};
use crate::runtime::protocol::{
    self, line_codec, worker_lost, ExecuteJob, HostMessage, JobResult, WorkerMessage,
};
use crate::runtime::sandbox::SandboxExecutor;
use crate::tracking::{ExecutionTracker, MemoryStore};
use crate::utils::config::PoolConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Extra time the host allows beyond a job's own wall-clock limit
const HOST_GRACE: Duration = Duration::from_secs(2);

/// Name of the isolation unit backing a worker id (`worker-3` → `fnrt-worker-3`)
pub fn container_name(worker_id: &str) -> String {
    format!("fnrt-{}", worker_id)
}

/// Liveness as observed from the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Alive,
    Exited(String),
}

#[async_trait]
pub trait WorkerHandle: Send + Sync {
    fn container_name(&self) -> &str;

    /// Wait until the worker accepts jobs
    async fn wait_ready(&self, timeout: Duration) -> Result<()>;

    /// Round-trip liveness check
    async fn ping(&self, timeout: Duration) -> Result<()>;

    fn probe(&self) -> Probe;

    /// Run one job; cancelling `cancel` preempts it
    async fn execute(&self, job: ExecuteJob, cancel: CancellationToken) -> Result<JobResult>;

    /// Stop the worker and release its resources
    async fn terminate(&self) -> Result<()>;
}

#[async_trait]
pub trait WorkerBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn start(&self, worker_id: &str) -> Result<Arc<dyn WorkerHandle>>;
}

/// Cancel `target` when `source` is cancelled, until the guard is dropped
fn forward_cancel(source: &CancellationToken, target: &CancellationToken) -> JoinHandle<()> {
    let source = source.clone();
    let target = target.clone();
    tokio::spawn(async move {
        source.cancelled().await;
        target.cancel();
    })
}

// ============================================================================
// In-process workers
// ============================================================================

pub struct LocalBackend {
    dependencies: Arc<DependencyResolver>,
}

impl LocalBackend {
    pub fn new(dependencies: Arc<DependencyResolver>) -> Self {
        Self { dependencies }
    }
}

#[async_trait]
impl WorkerBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn start(&self, worker_id: &str) -> Result<Arc<dyn WorkerHandle>> {
        let tracker = Arc::new(ExecutionTracker::new(Arc::new(MemoryStore::new())));
        debug!(worker_id, "starting in-process worker");
        Ok(Arc::new(LocalWorker {
            container_name: container_name(worker_id),
            executor: SandboxExecutor::new(tracker, self.dependencies.clone()),
            shutdown: CancellationToken::new(),
        }))
    }
}

struct LocalWorker {
    container_name: String,
    executor: SandboxExecutor,
    /// Cancelled on terminate; preempts everything still running
    shutdown: CancellationToken,
}

impl LocalWorker {
    fn check_alive(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Infrastructure(format!(
                "worker {} is stopped",
                self.container_name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerHandle for LocalWorker {
    fn container_name(&self) -> &str {
        &self.container_name
    }

    async fn wait_ready(&self, _timeout: Duration) -> Result<()> {
        self.check_alive()
    }

    async fn ping(&self, _timeout: Duration) -> Result<()> {
        self.check_alive()
    }

    fn probe(&self) -> Probe {
        if self.shutdown.is_cancelled() {
            Probe::Exited("terminated".to_string())
        } else {
            Probe::Alive
        }
    }

    async fn execute(&self, job: ExecuteJob, cancel: CancellationToken) -> Result<JobResult> {
        self.check_alive()?;
        let token = self.shutdown.child_token();
        let forward = forward_cancel(&cancel, &token);
        let result = protocol::run_job(&self.executor, job, token).await;
        forward.abort();
        Ok(result)
    }

    async fn terminate(&self) -> Result<()> {
        self.shutdown.cancel();
        Ok(())
    }
}

// ============================================================================
// Child-process workers
// ============================================================================

pub struct ProcessBackend {
    manager: ProcessManager,
    command: Option<PathBuf>,
    env_vars: Vec<(String, String)>,
    limiter: CgroupLimiter,
    limits: ProcessLimits,
}

impl ProcessBackend {
    pub fn new(command: Option<PathBuf>, limits: ProcessLimits) -> Self {
        Self {
            manager: ProcessManager::default(),
            command,
            env_vars: vec![],
            limiter: CgroupLimiter::default(),
            limits,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(
            config.worker_command.clone(),
            ProcessLimits {
                cpu_quota: Some(config.worker_cpu_quota),
                memory_limit_mb: Some(config.worker_memory_limit_mb),
            },
        )
    }

    pub fn with_limiter(mut self, limiter: CgroupLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl WorkerBackend for ProcessBackend {
    fn kind(&self) -> &'static str {
        "process"
    }

    async fn start(&self, worker_id: &str) -> Result<Arc<dyn WorkerHandle>> {
        let config = SpawnConfig {
            command: self.command.clone(),
            env_vars: self.env_vars.clone(),
            ..SpawnConfig::new(worker_id)
        };
        let mut child = self.manager.spawn(&config)?;
        let pid = child
            .id()
            .ok_or_else(|| EngineError::Infrastructure("worker exited during spawn".into()))?;

        self.limiter.apply(pid, self.limits);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Infrastructure("Failed to capture worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Infrastructure("Failed to capture worker stdout".into()))?;

        let shared = Arc::new(Pending::default());
        let (state_tx, state_rx) = watch::channel(ConnState::Starting);
        let reader = tokio::spawn(read_loop(
            worker_id.to_string(),
            FramedRead::new(stdout, line_codec()),
            shared.clone(),
            state_tx,
        ));

        info!(worker_id, pid, "worker process started");
        Ok(Arc::new(ProcessWorker {
            container_name: container_name(worker_id),
            worker_id: worker_id.to_string(),
            pid,
            child: Mutex::new(Some(child)),
            writer: Mutex::new(FramedWrite::new(stdin, line_codec())),
            shared,
            state: state_rx,
            reader,
            nonce: AtomicU64::new(0),
            manager: self.manager.clone(),
            limiter: self.limiter.clone(),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Starting,
    Ready,
    Closed,
}

/// Requests waiting for a worker reply
#[derive(Default)]
struct Pending {
    results: DashMap<String, oneshot::Sender<JobResult>>,
    pongs: DashMap<u64, oneshot::Sender<()>>,
}

async fn read_loop(
    worker_id: String,
    mut lines: FramedRead<tokio::process::ChildStdout, LinesCodec>,
    pending: Arc<Pending>,
    state: watch::Sender<ConnState>,
) {
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "unreadable worker output");
                break;
            }
        };
        match protocol::decode_line::<WorkerMessage>(&line) {
            Ok(WorkerMessage::Ready { pid, .. }) => {
                debug!(worker_id = %worker_id, pid, "worker ready");
                state.send_replace(ConnState::Ready);
            }
            Ok(WorkerMessage::Pong { nonce }) => {
                if let Some((_, tx)) = pending.pongs.remove(&nonce) {
                    let _ = tx.send(());
                }
            }
            Ok(WorkerMessage::Result { result }) => {
                match pending.results.remove(&result.execution_id) {
                    Some((_, tx)) => {
                        let _ = tx.send(*result);
                    }
                    None => warn!(
                        worker_id = %worker_id,
                        execution_id = %result.execution_id,
                        "result for unknown execution"
                    ),
                }
            }
            Err(e) => warn!(worker_id = %worker_id, error = %e, "dropping malformed worker message"),
        }
    }

    debug!(worker_id = %worker_id, "worker output closed");
    state.send_replace(ConnState::Closed);
    // Dropping the senders fails every waiter
    pending.results.clear();
    pending.pongs.clear();
}

struct ProcessWorker {
    container_name: String,
    worker_id: String,
    pid: u32,
    child: Mutex<Option<Child>>,
    writer: Mutex<FramedWrite<ChildStdin, LinesCodec>>,
    shared: Arc<Pending>,
    state: watch::Receiver<ConnState>,
    reader: JoinHandle<()>,
    nonce: AtomicU64,
    manager: ProcessManager,
    limiter: CgroupLimiter,
}

impl ProcessWorker {
    async fn send(&self, message: &HostMessage) -> Result<()> {
        let line = protocol::encode_line(message)?;
        self.writer.lock().await.send(line).await.map_err(|e| {
            EngineError::Infrastructure(format!(
                "cannot reach worker {}: {}",
                self.worker_id, e
            ))
        })
    }

    fn closed(&self) -> bool {
        *self.state.borrow() == ConnState::Closed
    }

    async fn kill(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(e) = self.manager.terminate(&mut child).await {
                warn!(worker_id = %self.worker_id, error = %e, "failed to stop worker process");
            }
        }
        self.limiter.cleanup(self.pid);
    }
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    fn container_name(&self) -> &str {
        &self.container_name
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.clone();
        let reached = tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s != ConnState::Starting),
        )
        .await
        .map_err(|_| {
            EngineError::Infrastructure(format!(
                "worker {} not ready after {:?}",
                self.worker_id, timeout
            ))
        })?;

        match reached.map(|s| *s) {
            Ok(ConnState::Ready) => Ok(()),
            _ => Err(EngineError::Infrastructure(format!(
                "worker {} exited before becoming ready",
                self.worker_id
            ))),
        }
    }

    async fn ping(&self, timeout: Duration) -> Result<()> {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pongs.insert(nonce, tx);

        if let Err(e) = self.send(&HostMessage::Ping { nonce }).await {
            self.shared.pongs.remove(&nonce);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(worker_lost(&self.worker_id)),
            Err(_) => {
                self.shared.pongs.remove(&nonce);
                Err(EngineError::Infrastructure(format!(
                    "worker {} did not answer ping",
                    self.worker_id
                )))
            }
        }
    }

    fn probe(&self) -> Probe {
        if self.closed() {
            Probe::Exited("connection closed".to_string())
        } else if !ProcessManager::is_running(self.pid) {
            Probe::Exited(format!("process {} is gone", self.pid))
        } else {
            Probe::Alive
        }
    }

    async fn execute(&self, job: ExecuteJob, cancel: CancellationToken) -> Result<JobResult> {
        if self.closed() {
            return Err(worker_lost(&self.worker_id));
        }

        let execution_id = job.execution_id.clone();
        let deadline = job.limits.wall_clock() + HOST_GRACE;
        let (tx, mut rx) = oneshot::channel();
        self.shared.results.insert(execution_id.clone(), tx);

        if let Err(e) = self.send(&HostMessage::Execute { job: Box::new(job) }).await {
            self.shared.results.remove(&execution_id);
            return Err(e);
        }

        let sleep = tokio::time::sleep(deadline);
        tokio::pin!(sleep);
        let mut preempted = false;

        loop {
            tokio::select! {
                result = &mut rx => {
                    return result.map_err(|_| worker_lost(&self.worker_id));
                }
                _ = cancel.cancelled(), if !preempted => {
                    preempted = true;
                    debug!(worker_id = %self.worker_id, execution_id = %execution_id, "preempting job");
                    if let Err(e) = self.send(&HostMessage::Cancel { execution_id: execution_id.clone() }).await {
                        self.shared.results.remove(&execution_id);
                        return Err(e);
                    }
                    // The worker answers with a preempted result
                    sleep.as_mut().reset(tokio::time::Instant::now() + HOST_GRACE);
                }
                _ = &mut sleep => {
                    self.shared.results.remove(&execution_id);
                    warn!(
                        worker_id = %self.worker_id,
                        execution_id = %execution_id,
                        "worker unresponsive past deadline, killing it"
                    );
                    self.kill().await;
                    return Err(EngineError::Timeout(deadline.as_millis() as u64));
                }
            }
        }
    }

    async fn terminate(&self) -> Result<()> {
        if !self.closed() {
            if let Err(e) = self.send(&HostMessage::Shutdown).await {
                debug!(worker_id = %self.worker_id, error = %e, "shutdown message not delivered");
            }
        }
        self.kill().await;
        self.reader.abort();
        info!(worker_id = %self.worker_id, "worker process stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::functions::Function;
    use crate::runtime::resource_limiter::ResourceLimits;
    use crate::runtime::sandbox::ExecutionOutcome;
    use crate::tracking::{ErrorKind, StepStatus};

    fn job(id: &str, code: &str, input: Value) -> ExecuteJob {
        ExecuteJob {
            execution_id: id.to_string(),
            function: Function::new("app", "main", code),
            library: vec![],
            input,
            context: Value::Null,
            limits: ResourceLimits::default(),
        }
    }

    #[test]
    fn test_container_name() {
        assert_eq!(container_name("worker-3"), "fnrt-worker-3");
    }

    #[tokio::test]
    async fn test_local_worker_runs_jobs() {
        let backend = LocalBackend::new(Arc::new(DependencyResolver::default()));
        let worker = backend.start("worker-1").await.unwrap();
        worker.wait_ready(Duration::from_secs(1)).await.unwrap();
        worker.ping(Duration::from_secs(1)).await.unwrap();

        let result = worker
            .execute(
                job("e1", "fn main(input) { return input + 1; }", Value::Int(1)),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.result.outcome, ExecutionOutcome::Completed { output: Value::Int(2) });
        assert_eq!(result.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_local_worker_preemption() {
        let backend = LocalBackend::new(Arc::new(DependencyResolver::default()));
        let worker = backend.start("worker-1").await.unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = worker
            .execute(
                job("e1", "fn main(input) { sleep(5000); return 1; }", Value::Null),
                cancel,
            )
            .await
            .unwrap();
        let error = result.result.outcome.error().cloned().unwrap();
        assert_eq!(error.kind, ErrorKind::Infrastructure);
        assert!(result.steps.iter().all(|s| s.status == StepStatus::Aborted));
    }

    #[tokio::test]
    async fn test_terminated_local_worker_rejects_jobs() {
        let backend = LocalBackend::new(Arc::new(DependencyResolver::default()));
        let worker = backend.start("worker-1").await.unwrap();
        worker.terminate().await.unwrap();

        assert!(matches!(worker.probe(), Probe::Exited(_)));
        let err = worker
            .execute(job("e1", "fn main() { return 1; }", Value::Null), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Infrastructure(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_worker_that_never_speaks() {
        // `cat` rejects the worker arguments and exits without announcing itself
        let backend = ProcessBackend::new(Some(PathBuf::from("/bin/cat")), ProcessLimits {
            cpu_quota: None,
            memory_limit_mb: None,
        })
        .with_limiter(CgroupLimiter::new(tempfile::tempdir().unwrap().into_path(), "test"));

        match backend.start("worker-1").await {
            Ok(worker) => {
                let err = worker.wait_ready(Duration::from_millis(200)).await.unwrap_err();
                assert!(matches!(err, EngineError::Infrastructure(_)));
                worker.terminate().await.unwrap();
                assert!(matches!(worker.probe(), Probe::Exited(_)));
            }
            // No /bin/cat on this host
            Err(e) => assert!(matches!(e, EngineError::Infrastructure(_))),
        }
    }
}
