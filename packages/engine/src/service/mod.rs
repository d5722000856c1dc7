// packages/engine/src/service/mod.rs
//! Invocation service
//!
//! [`FunctionRuntime`] is the single entry point for running a registered
//! function. Webhooks, schedules and the CLI all go through [`Invoker`]; the
//! runtime never re-checks authorization.
//!
//! Flow of one invocation:
//!
//! ```text
//! get_active ─► pending ─► link callees ─► running ─► sandbox | pool ─► terminal
//! ```
//!
//! Shared-pool functions run on a pooled worker and their steps are imported
//! afterwards; everything else runs in a sandbox on the host tracker.

use crate::codec::Value;
use crate::functions::{FunctionRef, FunctionRegistry};
use crate::observability::names;
use crate::runtime::{
    DependencyResolver, ExecuteJob, ExecutionRequest, LocalBackend, ProcessBackend,
    ResourceLimits, SandboxExecutor, WorkerBackend, WorkerPool,
};
use crate::script::InstrumentedFunction;
use crate::tracking::{
    Completion, ErrorKind, Execution, ExecutionDetail, ExecutionError, ExecutionStatus,
    ExecutionStore, ExecutionTracker, MemoryStore, SqliteStore, TriggerContext,
};
use crate::utils::config::{EngineConfig, StorageBackendKind, WorkerBackendKind};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Start an execution of a registered function
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Run to a terminal status and return the execution id
    ///
    /// Failed and timed-out executions still return their id; only a
    /// function that cannot be invoked at all is an error.
    async fn invoke(
        &self,
        function_ref: &FunctionRef,
        input: Value,
        trigger: TriggerContext,
    ) -> Result<String>;
}

struct Prepared {
    execution: Execution,
    function: Arc<InstrumentedFunction>,
}

pub struct FunctionRuntime {
    registry: Arc<FunctionRegistry>,
    tracker: Arc<ExecutionTracker>,
    executor: SandboxExecutor,
    pool: Arc<WorkerPool>,
    limits: ResourceLimits,
    shutdown: CancellationToken,
}

impl FunctionRuntime {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        tracker: Arc<ExecutionTracker>,
        dependencies: Arc<DependencyResolver>,
        pool: Arc<WorkerPool>,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            executor: SandboxExecutor::new(tracker.clone(), dependencies),
            registry,
            tracker,
            pool,
            limits,
            shutdown: CancellationToken::new(),
        }
    }

    /// Wire store, registry, pool and executor from configuration
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let store: Arc<dyn ExecutionStore> = match config.storage.backend {
            StorageBackendKind::Sqlite => Arc::new(SqliteStore::open(&config.storage.path)?),
            StorageBackendKind::Memory => Arc::new(MemoryStore::new()),
        };
        let dependencies = Arc::new(DependencyResolver::from_config(&config.execution));
        let backend: Arc<dyn WorkerBackend> = match config.pool.backend {
            WorkerBackendKind::Local => Arc::new(LocalBackend::new(dependencies.clone())),
            WorkerBackendKind::Process => Arc::new(ProcessBackend::from_config(&config.pool)),
        };

        Ok(Self::new(
            Arc::new(FunctionRegistry::new()),
            Arc::new(ExecutionTracker::new(store)),
            dependencies,
            WorkerPool::new(config.pool.clone(), backend),
            config.execution.limits(),
        ))
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    fn store(&self) -> &Arc<dyn ExecutionStore> {
        self.tracker.store()
    }

    /// Start the pool (initial scale and health checks)
    pub async fn start(&self) -> Result<()> {
        let report = self.pool.start().await?;
        if !report.failed.is_empty() {
            warn!(failed = ?report.failed, "some workers did not start");
        }
        Ok(())
    }

    /// Preempt host-side runs and drain the pool
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.stop().await;
    }

    /// Validate the call and record a `pending` execution
    fn prepare(
        &self,
        function_ref: &FunctionRef,
        input: Value,
        trigger: TriggerContext,
    ) -> Result<Prepared> {
        let function = self.registry.get_active(function_ref)?;
        let execution = Execution::pending(function_ref.to_string(), input, trigger);
        self.store().insert_execution(&execution)?;
        debug!(execution_id = %execution.id, function = %function_ref, "execution created");
        Ok(Prepared {
            execution,
            function,
        })
    }

    /// Run a prepared execution to its terminal status
    async fn run(&self, prepared: Prepared) {
        let Prepared {
            execution,
            function,
        } = prepared;
        let execution_id = execution.id.clone();
        let context = execution_context(&execution);
        let library = self.registry.link(&function);
        let started = Instant::now();

        let completion = if function.shared_pool() {
            self.run_on_pool(&execution, &function, library.definitions(), context, started)
                .await
        } else {
            match self.store().mark_running(&execution_id, Utc::now()) {
                Ok(()) => {
                    let request = ExecutionRequest {
                        execution_id: execution_id.clone(),
                        function,
                        library,
                        input: execution.input,
                        context,
                        limits: self.limits.clone(),
                    };
                    let result = self
                        .executor
                        .execute(request, self.shutdown.child_token())
                        .await;
                    result.outcome.into_completion(result.duration_ms)
                }
                Err(e) => Completion::failed(ExecutionError::from(&e)),
            }
        };

        self.finish(&execution_id, &execution.function_ref, completion);
    }

    async fn run_on_pool(
        &self,
        execution: &Execution,
        function: &InstrumentedFunction,
        library: Vec<crate::functions::Function>,
        context: Value,
        started: Instant,
    ) -> Completion {
        let lease = match self.pool.dispatch() {
            Ok(lease) => lease,
            Err(e) => {
                warn!(execution_id = %execution.id, "no eligible worker");
                // Never started: pending → failed
                return Completion::failed(ExecutionError::from(&e));
            }
        };

        let prepared = self
            .store()
            .set_worker(&execution.id, lease.worker_id())
            .and_then(|()| self.store().mark_running(&execution.id, Utc::now()));
        if let Err(e) = prepared {
            return Completion::failed(ExecutionError::from(&e));
        }

        let job = ExecuteJob {
            execution_id: execution.id.clone(),
            function: function.definition.as_ref().clone(),
            library,
            input: execution.input.clone(),
            context,
            limits: self.limits.clone(),
        };

        match self.pool.run(lease, job).await {
            Ok(job) => {
                if let Err(e) = self.tracker.import_steps(&execution.id, job.steps) {
                    warn!(execution_id = %execution.id, error = %e, "discarding worker steps");
                }
                job.result.outcome.into_completion(job.result.duration_ms)
            }
            Err(EngineError::Timeout(_)) => Completion::timed_out(ExecutionError::new(
                ErrorKind::Timeout,
                format!("execution timed out after {} ms", self.limits.wall_clock_ms),
            ))
            .with_duration(started.elapsed().as_millis() as u64),
            Err(e) => Completion::failed(ExecutionError::from(&e))
                .with_duration(started.elapsed().as_millis() as u64),
        }
    }

    fn finish(&self, execution_id: &str, function_ref: &str, completion: Completion) {
        let status = completion.status;
        let duration_ms = completion.duration_ms;

        if let Err(e) = self.store().complete_execution(execution_id, &completion) {
            warn!(execution_id, error = %e, "failed to record execution result");
        }

        metrics::counter!(names::EXECUTIONS_TOTAL, "status" => status.as_str()).increment(1);
        if let Some(ms) = duration_ms {
            metrics::histogram!(names::EXECUTION_DURATION_MS).record(ms as f64);
        }

        match (&completion.error, status) {
            (_, ExecutionStatus::Completed) => {
                info!(execution_id, function = function_ref, ?duration_ms, "execution completed")
            }
            (Some(error), _) => info!(
                execution_id,
                function = function_ref,
                status = status.as_str(),
                kind = ?error.kind,
                "execution ended: {}",
                error
            ),
            (None, _) => info!(execution_id, status = status.as_str(), "execution ended"),
        }
    }

    /// Create the execution and run it in the background
    pub fn submit(
        self: &Arc<Self>,
        function_ref: &FunctionRef,
        input: Value,
        trigger: TriggerContext,
    ) -> Result<String> {
        let prepared = self.prepare(function_ref, input, trigger)?;
        let execution_id = prepared.execution.id.clone();
        let span = info_span!("execution", execution_id = %execution_id, function = %function_ref);

        let runtime = self.clone();
        tokio::spawn(async move { runtime.run(prepared).await }.instrument(span));
        Ok(execution_id)
    }

    /// An execution with its recorded call tree
    pub fn get_execution(&self, execution_id: &str) -> Result<ExecutionDetail> {
        let execution = self
            .store()
            .get_execution(execution_id)?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;
        let steps = self.store().steps(execution_id)?;
        Ok(ExecutionDetail { execution, steps })
    }

    /// Most recent first
    pub fn list_executions(&self, function_ref: Option<&str>, limit: usize) -> Result<Vec<Execution>> {
        self.store().list_executions(function_ref, limit)
    }
}

#[async_trait]
impl Invoker for FunctionRuntime {
    async fn invoke(
        &self,
        function_ref: &FunctionRef,
        input: Value,
        trigger: TriggerContext,
    ) -> Result<String> {
        let prepared = self.prepare(function_ref, input, trigger)?;
        let execution_id = prepared.execution.id.clone();
        let span = info_span!("execution", execution_id = %execution_id, function = %function_ref);
        self.run(prepared).instrument(span).await;
        Ok(execution_id)
    }
}

/// Context map handed to two-parameter entry functions
fn execution_context(execution: &Execution) -> Value {
    let trigger = serde_json::to_value(execution.trigger.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    let mut context = BTreeMap::new();
    context.insert("execution_id".to_string(), Value::str(execution.id.clone()));
    context.insert("function".to_string(), Value::str(execution.function_ref.clone()));
    context.insert("trigger".to_string(), Value::str(trigger));
    context.insert(
        "principal".to_string(),
        execution
            .trigger
            .principal
            .clone()
            .map(Value::Str)
            .unwrap_or(Value::Null),
    );
    Value::Map(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::Function;
    use crate::tracking::{validate_tree, StepStatus, TriggerKind};
    use crate::utils::config::PoolConfig;
    use std::time::Duration;

    fn runtime(limits: ResourceLimits) -> Arc<FunctionRuntime> {
        let dependencies = Arc::new(DependencyResolver::default());
        let pool = WorkerPool::new(
            PoolConfig {
                backend: WorkerBackendKind::Local,
                ready_timeout_secs: 1,
                ..PoolConfig::default()
            },
            Arc::new(LocalBackend::new(dependencies.clone())),
        );
        Arc::new(FunctionRuntime::new(
            Arc::new(FunctionRegistry::new()),
            Arc::new(ExecutionTracker::new(Arc::new(MemoryStore::new()))),
            dependencies,
            pool,
            limits,
        ))
    }

    fn fref(s: &str) -> FunctionRef {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_invoke_records_tree() {
        let rt = runtime(ResourceLimits::default());
        rt.registry()
            .register(Function::new(
                "math",
                "square",
                "fn sq(x) { return x * x; } fn square(input) { return sq(input); }",
            ))
            .unwrap();

        let id = rt
            .invoke(&fref("math/square"), Value::Int(7), TriggerContext::manual())
            .await
            .unwrap();
        let detail = rt.get_execution(&id).unwrap();

        assert_eq!(detail.execution.status, ExecutionStatus::Completed);
        assert_eq!(detail.execution.output, Some(Value::Int(49)));
        assert!(detail.execution.duration_ms.is_some());
        assert_eq!(detail.steps.len(), 2);
        validate_tree(&id, &detail.steps).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_function_is_error() {
        let rt = runtime(ResourceLimits::default());
        let err = rt
            .invoke(&fref("nope/missing"), Value::Null, TriggerContext::manual())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(rt.list_executions(None, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_still_returns_id() {
        let rt = runtime(ResourceLimits::default());
        rt.registry()
            .register(Function::new(
                "app",
                "boom",
                r#"fn boom(input) { raise error("ValueError", "bad input"); }"#,
            ))
            .unwrap();

        let id = rt
            .invoke(&fref("app/boom"), Value::Null, TriggerContext::manual())
            .await
            .unwrap();
        let detail = rt.get_execution(&id).unwrap();
        assert_eq!(detail.execution.status, ExecutionStatus::Failed);
        let error = detail.execution.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Runtime);
        assert_eq!(error.error_type.as_deref(), Some("ValueError"));
        assert_eq!(detail.steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_running_steps() {
        let rt = runtime(ResourceLimits::default().with_timeout(Duration::from_millis(100)));
        rt.registry()
            .register(Function::new(
                "app",
                "slow",
                "fn nap() { sleep(2000); return 1; } fn slow(input) { return nap(); }",
            ))
            .unwrap();

        let id = rt
            .invoke(&fref("app/slow"), Value::Null, TriggerContext::manual())
            .await
            .unwrap();
        let detail = rt.get_execution(&id).unwrap();

        assert_eq!(detail.execution.status, ExecutionStatus::Timeout);
        assert_eq!(detail.execution.error.unwrap().kind, ErrorKind::Timeout);
        assert!(detail.steps.iter().all(|s| s.status != StepStatus::Running));
    }

    #[tokio::test]
    async fn test_shared_pool_without_workers_fails_pending() {
        let rt = runtime(ResourceLimits::default());
        rt.registry()
            .register(Function::new("app", "pooled", "fn pooled() { return 1; }").shared())
            .unwrap();

        let id = rt
            .invoke(&fref("app/pooled"), Value::Null, TriggerContext::manual())
            .await
            .unwrap();
        let detail = rt.get_execution(&id).unwrap();
        assert_eq!(detail.execution.status, ExecutionStatus::Failed);
        assert_eq!(detail.execution.error.unwrap().kind, ErrorKind::WorkerUnavailable);
        assert!(detail.execution.started_at.is_none());
    }

    #[tokio::test]
    async fn test_shared_pool_imports_worker_steps() {
        let rt = runtime(ResourceLimits::default());
        rt.pool().scale(2).await.unwrap();
        rt.registry()
            .register(Function::new("lib", "inc", "fn inc(x) { return x + 1; }"))
            .unwrap();
        rt.registry()
            .register(
                Function::new("app", "pooled", "fn pooled(input) { return lib::inc(input); }")
                    .enable_namespace("lib")
                    .shared(),
            )
            .unwrap();

        let id = rt
            .invoke(&fref("app/pooled"), Value::Int(1), TriggerContext::manual())
            .await
            .unwrap();
        let detail = rt.get_execution(&id).unwrap();

        assert_eq!(detail.execution.status, ExecutionStatus::Completed);
        assert_eq!(detail.execution.output, Some(Value::Int(2)));
        assert_eq!(detail.execution.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(detail.steps.len(), 2);
        validate_tree(&id, &detail.steps).unwrap();
    }

    #[tokio::test]
    async fn test_context_reaches_two_parameter_entry() {
        let rt = runtime(ResourceLimits::default());
        rt.registry()
            .register(Function::new(
                "app",
                "whoami",
                r#"fn whoami(input, context) { return context["principal"] + ":" + context["trigger"]; }"#,
            ))
            .unwrap();

        let trigger = TriggerContext::new(TriggerKind::Webhook).with_principal("alice");
        let id = rt.invoke(&fref("app/whoami"), Value::Null, trigger).await.unwrap();
        assert_eq!(
            rt.get_execution(&id).unwrap().execution.output,
            Some(Value::str("alice:webhook"))
        );
    }

    #[tokio::test]
    async fn test_concurrent_invocations_have_disjoint_trees() {
        let rt = runtime(ResourceLimits::default());
        rt.registry()
            .register(Function::new(
                "math",
                "fib",
                "fn f(n) { if n < 2 { return n; } return f(n - 1) + f(n - 2); } \
                 fn fib(input) { return f(input); }",
            ))
            .unwrap();

        let mut ids = Vec::new();
        for n in 0..8 {
            ids.push(rt.submit(&fref("math/fib"), Value::Int(n), TriggerContext::manual()).unwrap());
        }

        for id in &ids {
            let detail = loop {
                let detail = rt.get_execution(id).unwrap();
                if detail.execution.status.is_terminal() {
                    break detail;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            };
            assert_eq!(detail.execution.status, ExecutionStatus::Completed);
            assert!(detail.steps.iter().all(|s| s.execution_id == *id));
            validate_tree(id, &detail.steps).unwrap();
        }
    }
}
