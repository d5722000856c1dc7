// packages/engine/src/runtime/worker_pool.rs
//! Elastic pool of shared workers
//!
//! Shared-pool functions run on long-lived workers instead of a per-caller
//! sandbox. The pool scales between configured bounds, dispatches
//! round-robin and replaces workers that die.
//!
//! # Architecture
//!
//! ```text
//! WorkerPool
//! ├─ workers:  {worker-1, worker-2, ...}    (every record, any status)
//! ├─ eligible: [worker-1, worker-3, ...]    (running, not draining; snapshot)
//! └─ cursor:   atomic round-robin index into the snapshot
//! ```
//!
//! Per-worker state machine:
//!
//! ```text
//! created → running → restarting → running
//!                   ↘ exited | missing
//! ```
//!
//! Scale operations, restarts and health checks are serialized by one lock;
//! dispatch never takes it.

use crate::observability::names;
use crate::runtime::backend::{Probe, WorkerBackend, WorkerHandle};
use crate::runtime::protocol::{ExecuteJob, JobResult};
use crate::runtime::sandbox::{ExecutionOutcome, ExecutionResult, PREEMPTED_REASON};
use crate::tracking::{ErrorKind, ExecutionError};
use crate::utils::backoff::Backoff;
use crate::utils::config::PoolConfig;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const START_BACKOFF_INITIAL: Duration = Duration::from_millis(50);
const START_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Time preempted jobs get to report back before their worker is stopped
const PREEMPT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Created,
    Running,
    Restarting,
    Exited,
    Missing,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 5] = [
        WorkerStatus::Created,
        WorkerStatus::Running,
        WorkerStatus::Restarting,
        WorkerStatus::Exited,
        WorkerStatus::Missing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Created => "created",
            WorkerStatus::Running => "running",
            WorkerStatus::Restarting => "restarting",
            WorkerStatus::Exited => "exited",
            WorkerStatus::Missing => "missing",
        }
    }
}

/// Snapshot of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub container_name: String,
    pub status: WorkerStatus,
    pub created_at: DateTime<Utc>,
    /// Executions run over the worker's lifetime
    pub executions: u64,
    pub draining: bool,
    pub in_flight: usize,
}

/// Outcome of a scale request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleReport {
    pub previous: usize,
    pub target: usize,
    pub current: usize,
    pub started: Vec<String>,
    /// Workers that never became ready (recorded as missing)
    pub failed: Vec<String>,
    pub removed: Vec<String>,
    /// Executions cut short because draining timed out
    pub preempted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked: usize,
    pub restarted: Vec<String>,
    pub missing: Vec<String>,
    pub recovered: Vec<String>,
}

struct Worker {
    id: String,
    index: u64,
    container_name: String,
    created_at: DateTime<Utc>,
    /// Absent until started and while restarting
    handle: RwLock<Option<Arc<dyn WorkerHandle>>>,
    status: RwLock<WorkerStatus>,
    executions: AtomicU64,
    in_flight: AtomicUsize,
    draining: AtomicBool,
    idle: Notify,
    /// Cancelled when a drain times out
    preempt: CancellationToken,
}

impl Worker {
    fn new(index: u64) -> Self {
        let id = format!("worker-{}", index);
        Self {
            container_name: crate::runtime::backend::container_name(&id),
            id,
            index,
            created_at: Utc::now(),
            handle: RwLock::new(None),
            status: RwLock::new(WorkerStatus::Created),
            executions: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            idle: Notify::new(),
            preempt: CancellationToken::new(),
        }
    }

    fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    fn set_status(&self, status: WorkerStatus) {
        let previous = std::mem::replace(&mut *self.status.write(), status);
        if previous != status {
            debug!(worker_id = %self.id, from = previous.as_str(), to = status.as_str(), "worker status changed");
        }
    }

    fn handle(&self) -> Option<Arc<dyn WorkerHandle>> {
        self.handle.read().clone()
    }

    fn eligible(&self) -> bool {
        self.status() == WorkerStatus::Running && !self.draining.load(Ordering::SeqCst)
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            container_name: self.container_name.clone(),
            status: self.status(),
            created_at: self.created_at,
            executions: self.executions.load(Ordering::Relaxed),
            draining: self.draining.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }
}

/// A dispatched slot on one worker; dropping it ends the in-flight count
pub struct WorkerLease {
    worker: Arc<Worker>,
}

impl WorkerLease {
    pub fn worker_id(&self) -> &str {
        &self.worker.id
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.worker.release();
    }
}

pub struct WorkerPool {
    config: PoolConfig,
    backend: Arc<dyn WorkerBackend>,
    workers: DashMap<String, Arc<Worker>>,
    eligible: RwLock<Arc<Vec<Arc<Worker>>>>,
    cursor: AtomicUsize,
    next_index: AtomicU64,
    scale_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    health_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    me: Weak<WorkerPool>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, backend: Arc<dyn WorkerBackend>) -> Arc<Self> {
        info!(
            backend = backend.kind(),
            min = config.min_workers,
            max = config.max_workers,
            "Initializing worker pool"
        );
        Arc::new_cyclic(|me| Self {
            config,
            backend,
            workers: DashMap::new(),
            eligible: RwLock::new(Arc::new(Vec::new())),
            cursor: AtomicUsize::new(0),
            next_index: AtomicU64::new(1),
            scale_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            health_task: parking_lot::Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Scale to `default_workers` and begin periodic health checks
    pub async fn start(&self) -> Result<ScaleReport> {
        let report = self.scale(self.config.default_workers as i64).await?;

        let me = self.me.clone();
        let shutdown = self.shutdown.clone();
        let period = self.config.health_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = me.upgrade() else { break };
                        let report = pool.health_check().await;
                        if !report.restarted.is_empty() || !report.missing.is_empty() {
                            info!(
                                restarted = ?report.restarted,
                                missing = ?report.missing,
                                "health check changed workers"
                            );
                        }
                    }
                }
            }
            debug!("health loop stopped");
        });
        *self.health_task.lock() = Some(task);

        Ok(report)
    }

    /// Stop health checks and drain every worker
    pub async fn stop(&self) -> ScaleReport {
        self.shutdown.cancel();
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
        let _guard = self.scale_lock.lock().await;
        let report = self.resize(0).await;
        info!(removed = report.removed.len(), "worker pool stopped");
        report
    }

    /// Scale the pool to exactly `target` workers
    ///
    /// Targets outside `[min_workers, max_workers]` are rejected and leave
    /// the pool untouched.
    pub async fn scale(&self, target: i64) -> Result<ScaleReport> {
        let (min, max) = (self.config.min_workers, self.config.max_workers);
        if target < min as i64 || target > max as i64 {
            warn!(target, min, max, "rejecting scale request");
            return Err(EngineError::OutOfRange { target, min, max });
        }

        let _guard = self.scale_lock.lock().await;
        Ok(self.resize(target as usize).await)
    }

    /// Caller holds `scale_lock`
    async fn resize(&self, target: usize) -> ScaleReport {
        let previous = self.workers.len();
        let mut report = ScaleReport {
            previous,
            target,
            ..Default::default()
        };

        if target > previous {
            self.scale_up(target - previous, &mut report).await;
        } else if target < previous {
            self.scale_down(previous - target, &mut report).await;
        }

        report.current = self.workers.len();
        self.refresh();
        info!(
            previous,
            target,
            started = report.started.len(),
            failed = report.failed.len(),
            removed = report.removed.len(),
            preempted = report.preempted,
            "pool scaled"
        );
        report
    }

    async fn scale_up(&self, count: usize, report: &mut ScaleReport) {
        let fresh: Vec<Arc<Worker>> = (0..count)
            .map(|_| {
                let worker = Arc::new(Worker::new(self.next_index.fetch_add(1, Ordering::Relaxed)));
                self.workers.insert(worker.id.clone(), worker.clone());
                worker
            })
            .collect();

        let outcomes = join_all(fresh.iter().map(|worker| async move {
            let outcome = self.start_with_retries(&worker.id).await;
            (worker, outcome)
        }))
        .await;

        for (worker, outcome) in outcomes {
            match outcome {
                Ok(handle) => {
                    *worker.handle.write() = Some(handle);
                    worker.set_status(WorkerStatus::Running);
                    report.started.push(worker.id.clone());
                }
                Err(e) => {
                    error!(worker_id = %worker.id, error = %e, "worker failed to start");
                    worker.set_status(WorkerStatus::Missing);
                    report.failed.push(worker.id.clone());
                }
            }
        }
    }

    async fn scale_down(&self, count: usize, report: &mut ScaleReport) {
        let mut candidates: Vec<Arc<Worker>> =
            self.workers.iter().map(|entry| entry.value().clone()).collect();
        // Unhealthy first, then newest
        candidates.sort_by_key(|w| (w.status() == WorkerStatus::Running, std::cmp::Reverse(w.index)));
        candidates.truncate(count);

        for worker in &candidates {
            worker.draining.store(true, Ordering::SeqCst);
        }
        self.refresh();

        let retired = join_all(candidates.iter().map(|worker| self.retire(worker))).await;
        for (worker, preempted) in candidates.iter().zip(retired) {
            self.workers.remove(&worker.id);
            report.removed.push(worker.id.clone());
            report.preempted += preempted;
        }
    }

    /// Drain, preempt what outlives the drain timeout, terminate
    async fn retire(&self, worker: &Worker) -> usize {
        let drain_timeout = self.config.drain_timeout();
        let mut preempted = 0;

        if tokio::time::timeout(drain_timeout, worker.wait_idle()).await.is_err() {
            preempted = worker.in_flight.load(Ordering::SeqCst);
            warn!(
                worker_id = %worker.id,
                in_flight = preempted,
                "drain timed out, preempting executions"
            );
            worker.preempt.cancel();
            let _ = tokio::time::timeout(PREEMPT_GRACE, worker.wait_idle()).await;
        }

        let handle = worker.handle.write().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.terminate().await {
                warn!(worker_id = %worker.id, error = %e, "failed to terminate worker");
            }
        }
        worker.set_status(WorkerStatus::Exited);
        preempted
    }

    async fn start_with_retries(&self, worker_id: &str) -> Result<Arc<dyn WorkerHandle>> {
        let mut backoff = Backoff::new(START_BACKOFF_INITIAL, START_BACKOFF_MAX);
        let retries = self.config.start_attempts.saturating_sub(1);

        loop {
            match self.try_start(worker_id).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    metrics::counter!(names::WORKER_START_FAILURES_TOTAL).increment(1);
                    if backoff.exceeded_max_attempts(retries) {
                        return Err(e);
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        worker_id,
                        attempt = backoff.attempt,
                        error = %e,
                        "worker start failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_start(&self, worker_id: &str) -> Result<Arc<dyn WorkerHandle>> {
        let handle = self.backend.start(worker_id).await?;
        if let Err(e) = handle.wait_ready(self.config.ready_timeout()).await {
            if let Err(stop) = handle.terminate().await {
                debug!(worker_id, error = %stop, "cleanup of unready worker failed");
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Re-derive the eligible snapshot and the status gauges
    fn refresh(&self) {
        let mut eligible: Vec<Arc<Worker>> = self
            .workers
            .iter()
            .filter(|entry| entry.value().eligible())
            .map(|entry| entry.value().clone())
            .collect();
        eligible.sort_by_key(|w| w.index);
        *self.eligible.write() = Arc::new(eligible);

        let mut counts = [0usize; WorkerStatus::ALL.len()];
        for entry in self.workers.iter() {
            let status = entry.value().status();
            if let Some(slot) = WorkerStatus::ALL.iter().position(|s| *s == status) {
                counts[slot] += 1;
            }
        }
        for (status, count) in WorkerStatus::ALL.iter().zip(counts) {
            metrics::gauge!(names::WORKERS, "status" => status.as_str()).set(count as f64);
        }
    }

    /// Pick the next eligible worker round-robin
    pub fn dispatch(&self) -> Result<WorkerLease> {
        let snapshot = self.eligible.read().clone();

        for _ in 0..snapshot.len() {
            let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % snapshot.len();
            let worker = &snapshot[slot];

            worker.in_flight.fetch_add(1, Ordering::SeqCst);
            // Re-check after counting so a concurrent drain cannot miss us
            if !worker.eligible() {
                worker.release();
                continue;
            }

            metrics::counter!(names::DISPATCH_TOTAL, "outcome" => "dispatched").increment(1);
            return Ok(WorkerLease {
                worker: worker.clone(),
            });
        }

        metrics::counter!(names::DISPATCH_TOTAL, "outcome" => "unavailable").increment(1);
        Err(EngineError::WorkerUnavailable)
    }

    /// Run a job on a leased worker
    ///
    /// A job preempted by scale-down comes back as a failed result. A worker
    /// that died under the job is restarted in the background.
    pub async fn run(&self, lease: WorkerLease, job: ExecuteJob) -> Result<JobResult> {
        let worker = lease.worker.clone();
        let handle = worker
            .handle()
            .ok_or_else(|| EngineError::Infrastructure(format!("worker {} has no process", worker.id)))?;

        let execution_id = job.execution_id.clone();
        let cancel = worker.preempt.child_token();
        let result = handle.execute(job, cancel.clone()).await;
        worker.executions.fetch_add(1, Ordering::Relaxed);
        drop(lease);

        match result {
            Ok(result) => Ok(result),
            Err(e) if cancel.is_cancelled() => {
                debug!(worker_id = %worker.id, execution_id = %execution_id, error = %e, "preempted job lost its worker");
                Ok(JobResult {
                    execution_id,
                    result: ExecutionResult {
                        outcome: ExecutionOutcome::failed(ExecutionError::new(
                            ErrorKind::Infrastructure,
                            PREEMPTED_REASON,
                        )),
                        duration_ms: 0,
                    },
                    steps: Vec::new(),
                })
            }
            Err(e) => {
                if let Probe::Exited(reason) = handle.probe() {
                    warn!(worker_id = %worker.id, reason = %reason, "worker died during execution");
                    self.schedule_restart(&worker.id);
                }
                Err(e)
            }
        }
    }

    /// Dispatch and run
    pub async fn execute(&self, job: ExecuteJob) -> Result<JobResult> {
        let lease = self.dispatch()?;
        self.run(lease, job).await
    }

    fn schedule_restart(&self, worker_id: &str) {
        let Some(pool) = self.me.upgrade() else { return };
        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = pool.restart_worker(&worker_id).await {
                warn!(worker_id = %worker_id, error = %e, "restart failed");
            }
        });
    }

    /// Replace a worker's process, leaving it `running` or `missing`
    pub async fn restart_worker(&self, worker_id: &str) -> Result<WorkerStatus> {
        let _guard = self.scale_lock.lock().await;
        let worker = self
            .workers
            .get(worker_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::NotFound(format!("worker {}", worker_id)))?;
        Ok(self.restart_locked(&worker).await)
    }

    async fn restart_locked(&self, worker: &Worker) -> WorkerStatus {
        if worker.draining.load(Ordering::SeqCst) {
            return worker.status();
        }

        worker.set_status(WorkerStatus::Restarting);
        self.refresh();

        let old = worker.handle.write().take();
        if let Some(old) = old {
            if let Err(e) = old.terminate().await {
                debug!(worker_id = %worker.id, error = %e, "old worker did not stop cleanly");
            }
        }

        let status = match self.start_with_retries(&worker.id).await {
            Ok(handle) => {
                *worker.handle.write() = Some(handle);
                info!(worker_id = %worker.id, "worker restarted");
                WorkerStatus::Running
            }
            Err(e) => {
                error!(worker_id = %worker.id, error = %e, "worker could not be restarted");
                WorkerStatus::Missing
            }
        };
        worker.set_status(status);
        self.refresh();
        status
    }

    /// Probe every non-draining worker
    ///
    /// Exited workers are restarted; unreachable ones become `missing`;
    /// missing ones return to `running` only after passing a readiness check.
    pub async fn health_check(&self) -> HealthReport {
        let _guard = self.scale_lock.lock().await;
        let mut report = HealthReport::default();

        let mut workers: Vec<Arc<Worker>> =
            self.workers.iter().map(|entry| entry.value().clone()).collect();
        workers.sort_by_key(|w| w.index);

        let timeout = self.config.ready_timeout();
        for worker in workers {
            if worker.draining.load(Ordering::SeqCst) {
                continue;
            }
            report.checked += 1;

            match worker.status() {
                WorkerStatus::Running => {
                    let Some(handle) = worker.handle() else {
                        worker.set_status(WorkerStatus::Missing);
                        report.missing.push(worker.id.clone());
                        continue;
                    };
                    match handle.probe() {
                        Probe::Exited(reason) => {
                            warn!(worker_id = %worker.id, reason = %reason, "worker exited");
                            if self.restart_locked(&worker).await == WorkerStatus::Running {
                                report.restarted.push(worker.id.clone());
                            } else {
                                report.missing.push(worker.id.clone());
                            }
                        }
                        Probe::Alive => {
                            if let Err(e) = handle.ping(timeout).await {
                                warn!(worker_id = %worker.id, error = %e, "worker unreachable");
                                worker.set_status(WorkerStatus::Missing);
                                report.missing.push(worker.id.clone());
                            }
                        }
                    }
                }
                WorkerStatus::Missing => {
                    if self.readiness_check(&worker, timeout).await {
                        worker.set_status(WorkerStatus::Running);
                        report.recovered.push(worker.id.clone());
                    }
                }
                _ => {}
            }
        }

        self.refresh();
        report
    }

    async fn readiness_check(&self, worker: &Worker, timeout: Duration) -> bool {
        if let Some(handle) = worker.handle() {
            if matches!(handle.probe(), Probe::Alive) && handle.ping(timeout).await.is_ok() {
                return true;
            }
            *worker.handle.write() = None;
            if let Err(e) = handle.terminate().await {
                debug!(worker_id = %worker.id, error = %e, "stale worker did not stop cleanly");
            }
        }

        match self.try_start(&worker.id).await {
            Ok(handle) => {
                *worker.handle.write() = Some(handle);
                true
            }
            Err(e) => {
                debug!(worker_id = %worker.id, error = %e, "missing worker still not ready");
                false
            }
        }
    }

    /// Drop a worker record, stopping its process if it has one
    pub async fn remove_worker(&self, worker_id: &str) -> Result<WorkerInfo> {
        let _guard = self.scale_lock.lock().await;
        let (_, worker) = self
            .workers
            .remove(worker_id)
            .ok_or_else(|| EngineError::NotFound(format!("worker {}", worker_id)))?;

        worker.draining.store(true, Ordering::SeqCst);
        self.refresh();
        self.retire(&worker).await;
        self.refresh();
        info!(worker_id, "worker removed");
        Ok(worker.info())
    }

    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<Arc<Worker>> =
            self.workers.iter().map(|entry| entry.value().clone()).collect();
        workers.sort_by_key(|w| w.index);
        workers.iter().map(|w| w.info()).collect()
    }

    pub fn count(&self) -> usize {
        self.workers.len()
    }

    pub fn count_by_status(&self, status: WorkerStatus) -> usize {
        self.workers
            .iter()
            .filter(|entry| entry.value().status() == status)
            .count()
    }
}
