// packages/engine/src/runtime/sandbox.rs
//! Sandbox executor
//!
//! Runs one instrumented function under resource limits:
//! - Input checked against the input schema before anything starts
//! - Requirements resolved before execution
//! - Interpreter on a dedicated thread, raced against the wall clock
//! - Return value checked against the output schema
//!
//! Every limit ends up as the execution's outcome. Nothing here panics or
//! propagates user failures as host errors.

use crate::codec::Value;
use crate::functions::has_schema;
use crate::runtime::dependencies::DependencyResolver;
use crate::runtime::resource_limiter::ResourceLimits;
use crate::script::{Budget, ExecEnv, Fault, InstrumentedFunction, Library, INTERPRETER_STACK_BYTES};
use crate::tracking::{Completion, ErrorKind, ExecutionError, ExecutionStatus, ExecutionTracker};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a cancelled interpreter thread gets to unwind
const DEFAULT_GRACE: Duration = Duration::from_millis(250);

/// Recorded on executions cut short by a scale-down
pub const PREEMPTED_REASON: &str = "execution preempted by scale-down";

/// Everything needed to run one execution
pub struct ExecutionRequest {
    pub execution_id: String,
    pub function: Arc<InstrumentedFunction>,
    /// Cross-submission callees, already linked
    pub library: Library,
    pub input: Value,
    /// Second argument of two-parameter entry functions
    pub context: Value,
    pub limits: ResourceLimits,
}

/// Terminal result of a sandboxed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed { output: Value },
    Failed { error: ExecutionError },
    Timeout { error: ExecutionError },
}

impl ExecutionOutcome {
    pub fn failed(error: ExecutionError) -> Self {
        ExecutionOutcome::Failed { error }
    }

    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionOutcome::Completed { .. } => ExecutionStatus::Completed,
            ExecutionOutcome::Failed { .. } => ExecutionStatus::Failed,
            ExecutionOutcome::Timeout { .. } => ExecutionStatus::Timeout,
        }
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        match self {
            ExecutionOutcome::Completed { .. } => None,
            ExecutionOutcome::Failed { error } | ExecutionOutcome::Timeout { error } => Some(error),
        }
    }

    pub fn into_completion(self, duration_ms: u64) -> Completion {
        let completion = match self {
            ExecutionOutcome::Completed { output } => Completion::completed(output),
            ExecutionOutcome::Failed { error } => Completion::failed(error),
            ExecutionOutcome::Timeout { error } => Completion::timed_out(error),
        };
        completion.with_duration(duration_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub duration_ms: u64,
}

/// Check `value` against an optional JSON Schema
pub fn check_schema(
    which: &str,
    schema: &Option<serde_json::Value>,
    value: &Value,
) -> std::result::Result<(), String> {
    let Some(schema) = schema.as_ref().filter(|_| has_schema(schema)) else {
        return Ok(());
    };

    let compiled = JSONSchema::compile(schema)
        .map_err(|e| format!("{} schema is invalid: {}", which, e))?;
    let instance = value.to_json();
    let result = compiled.validate(&instance);
    if let Err(errors) = result {
        let reasons: Vec<String> = errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();
        return Err(format!("{} does not match its schema: {}", which, reasons.join("; ")));
    }
    Ok(())
}

enum RunEnd {
    Finished(std::result::Result<Value, Fault>),
    Crashed,
    TimedOut,
    Preempted,
}

/// Runs instrumented functions in-process
pub struct SandboxExecutor {
    tracker: Arc<ExecutionTracker>,
    dependencies: Arc<DependencyResolver>,
    grace: Duration,
}

impl SandboxExecutor {
    pub fn new(tracker: Arc<ExecutionTracker>, dependencies: Arc<DependencyResolver>) -> Self {
        Self {
            tracker,
            dependencies,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    /// Run to completion, timeout or preemption (`cancel`)
    pub async fn execute(&self, request: ExecutionRequest, cancel: CancellationToken) -> ExecutionResult {
        let started = Instant::now();
        let execution_id = request.execution_id.clone();
        let outcome = self.run(request, cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        debug!(
            execution_id = %execution_id,
            status = %outcome.status(),
            duration_ms,
            "sandboxed run finished"
        );
        ExecutionResult {
            outcome,
            duration_ms,
        }
    }

    async fn run(&self, request: ExecutionRequest, cancel: CancellationToken) -> ExecutionOutcome {
        let ExecutionRequest {
            execution_id,
            function,
            library,
            input,
            context,
            limits,
        } = request;

        if let Err(reason) = check_schema("input", &function.input_schema, &input) {
            return ExecutionOutcome::failed(ExecutionError::new(ErrorKind::SchemaValidation, reason));
        }

        let mut requirements = function.requirements.clone();
        requirements.extend(library.requirements());
        requirements.sort();
        requirements.dedup();
        if let Err(e) = self.dependencies.resolve(&requirements) {
            return ExecutionOutcome::failed(ExecutionError::from(&e));
        }

        let scratch = if function.uses_module("fs") || library.uses_module("fs") {
            match tempfile::Builder::new().prefix("fnrt-scratch-").tempdir() {
                Ok(dir) => Some(dir),
                Err(e) => {
                    return ExecutionOutcome::failed(ExecutionError::new(
                        ErrorKind::Infrastructure,
                        format!("failed to create scratch directory: {}", e),
                    ))
                }
            }
        } else {
            None
        };

        self.tracker.open_execution(&execution_id);
        let budget_token = cancel.child_token();
        let env = Arc::new(ExecEnv {
            execution_id: execution_id.clone(),
            tracker: self.tracker.clone(),
            library,
            budget: Budget::new(&limits, budget_token.clone()),
            scratch: scratch.as_ref().map(|dir| dir.path().to_path_buf()),
        });

        let (tx, mut rx) = oneshot::channel();
        let entry = function.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("fnrt-exec-{}", execution_id))
            .stack_size(INTERPRETER_STACK_BYTES)
            .spawn(move || {
                // Scratch space lives exactly as long as the run
                let _scratch = scratch;
                let _ = tx.send(entry.run(env, input, context));
            });

        if let Err(e) = spawned {
            self.close(&execution_id, "interpreter did not start");
            return ExecutionOutcome::failed(ExecutionError::new(
                ErrorKind::Infrastructure,
                format!("failed to start interpreter thread: {}", e),
            ));
        }

        let end = tokio::select! {
            result = &mut rx => match result {
                Ok(result) => RunEnd::Finished(result),
                Err(_) => RunEnd::Crashed,
            },
            _ = tokio::time::sleep(limits.wall_clock()) => RunEnd::TimedOut,
            _ = cancel.cancelled() => RunEnd::Preempted,
        };

        match end {
            RunEnd::Finished(Ok(output)) => {
                self.close(&execution_id, "execution finished");
                if !output.is_encodable() {
                    return ExecutionOutcome::failed(
                        ExecutionError::new(
                            ErrorKind::Runtime,
                            "return value contains a non-finite float",
                        )
                        .with_type("ValueError"),
                    );
                }
                if let Err(reason) = check_schema("output", &function.output_schema, &output) {
                    return ExecutionOutcome::failed(ExecutionError::new(
                        ErrorKind::SchemaValidation,
                        reason,
                    ));
                }
                ExecutionOutcome::Completed { output }
            }
            // The interpreter saw the cancellation before select! did
            RunEnd::Finished(Err(Fault::Aborted(_))) if cancel.is_cancelled() => {
                self.close(&execution_id, PREEMPTED_REASON);
                ExecutionOutcome::failed(ExecutionError::new(
                    ErrorKind::Infrastructure,
                    PREEMPTED_REASON,
                ))
            }
            RunEnd::Finished(Err(fault)) => {
                self.close(&execution_id, &fault.to_string());
                match fault {
                    Fault::Aborted(_) => ExecutionOutcome::Timeout {
                        error: fault.to_execution_error(),
                    },
                    other => ExecutionOutcome::failed(other.to_execution_error()),
                }
            }
            RunEnd::Crashed => {
                self.close(&execution_id, "interpreter crashed");
                ExecutionOutcome::failed(ExecutionError::new(
                    ErrorKind::Infrastructure,
                    "interpreter thread terminated unexpectedly",
                ))
            }
            RunEnd::TimedOut => {
                let reason = format!("execution timed out after {} ms", limits.wall_clock_ms);
                budget_token.cancel();
                self.close(&execution_id, &reason);
                self.await_unwind(&execution_id, &mut rx).await;
                info!(execution_id = %execution_id, "{}", reason);
                ExecutionOutcome::Timeout {
                    error: ExecutionError::new(ErrorKind::Timeout, reason),
                }
            }
            RunEnd::Preempted => {
                let reason = PREEMPTED_REASON;
                self.close(&execution_id, reason);
                self.await_unwind(&execution_id, &mut rx).await;
                ExecutionOutcome::failed(ExecutionError::new(ErrorKind::Infrastructure, reason))
            }
        }
    }

    fn close(&self, execution_id: &str, reason: &str) {
        match self.tracker.close_execution(execution_id, reason) {
            Ok(0) => {}
            Ok(aborted) => debug!(execution_id, aborted, "aborted open steps"),
            Err(e) => warn!(execution_id, error = %e, "failed to close execution"),
        }
    }

    async fn await_unwind(
        &self,
        execution_id: &str,
        rx: &mut oneshot::Receiver<std::result::Result<Value, Fault>>,
    ) {
        if tokio::time::timeout(self.grace, rx).await.is_err() {
            warn!(execution_id, "interpreter thread still running after cancellation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::Function;
    use crate::script::validate_and_instrument;
    use crate::tracking::storage::FailingSteps;
    use crate::tracking::{validate_tree, MemoryStore, StepStatus};
    use serde_json::json;

    fn executor() -> SandboxExecutor {
        let tracker = Arc::new(ExecutionTracker::new(Arc::new(MemoryStore::new())));
        SandboxExecutor::new(
            tracker,
            Arc::new(DependencyResolver::new(true, ["regex", "base64"])),
        )
    }

    fn request(function: Function, input: serde_json::Value, limits: ResourceLimits) -> ExecutionRequest {
        ExecutionRequest {
            execution_id: ulid::Ulid::new().to_string(),
            function: Arc::new(validate_and_instrument(function).unwrap()),
            library: Library::new(),
            input: Value::from_json(input),
            context: Value::Null,
            limits,
        }
    }

    fn source(code: &str) -> Function {
        Function::new("test", "main", code)
    }

    #[tokio::test]
    async fn test_completed_run_records_tree() {
        let executor = executor();
        let req = request(
            source("fn inc(x) { return x + 1; } fn main(input) { return inc(input); }"),
            json!(1),
            ResourceLimits::default(),
        );
        let id = req.execution_id.clone();
        let result = executor.execute(req, CancellationToken::new()).await;

        assert_eq!(result.outcome, ExecutionOutcome::Completed { output: Value::Int(2) });
        let steps = executor.tracker().steps(&id).unwrap();
        assert_eq!(steps.len(), 2);
        validate_tree(&id, &steps).unwrap();
        assert!(!executor.tracker().is_open(&id));
    }

    #[tokio::test]
    async fn test_input_schema_checked_before_start() {
        let executor = executor();
        let function = source("fn main(input) { return input; }").with_input_schema(json!({
            "type": "object",
            "required": ["n"],
            "properties": {"n": {"type": "integer"}}
        }));
        let req = request(function, json!({"n": "three"}), ResourceLimits::default());
        let id = req.execution_id.clone();
        let result = executor.execute(req, CancellationToken::new()).await;

        let error = result.outcome.error().unwrap();
        assert_eq!(error.kind, ErrorKind::SchemaValidation);
        assert!(executor.tracker().steps(&id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_output_schema_violation_fails() {
        let executor = executor();
        let function = source("fn main(input) { return \"text\"; }")
            .with_output_schema(json!({"type": "integer"}));
        let result = executor
            .execute(
                request(function, json!(null), ResourceLimits::default()),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.outcome.status(), ExecutionStatus::Failed);
        assert_eq!(result.outcome.error().unwrap().kind, ErrorKind::SchemaValidation);
    }

    #[tokio::test]
    async fn test_dependency_failure_is_distinct() {
        let tracker = Arc::new(ExecutionTracker::new(Arc::new(MemoryStore::new())));
        let executor = SandboxExecutor::new(
            tracker,
            Arc::new(DependencyResolver::new(false, ["regex"])),
        );
        let function = source("import regex; fn main(input) { return regex.is_match(\"a\", input); }")
            .requiring(["regex"]);
        let result = executor
            .execute(
                request(function, json!("a"), ResourceLimits::default()),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.outcome.error().unwrap().kind, ErrorKind::Dependency);
    }

    #[tokio::test]
    async fn test_timeout_aborts_open_steps() {
        let executor = executor();
        let limits = ResourceLimits::default().with_timeout(Duration::from_millis(100));
        let req = request(
            source("fn nap(ms) { sleep(ms); return 1; } fn main(input) { return nap(5000); }"),
            json!(null),
            limits,
        );
        let id = req.execution_id.clone();
        let started = Instant::now();
        let result = executor.execute(req, CancellationToken::new()).await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(result.outcome.status(), ExecutionStatus::Timeout);
        assert_eq!(result.outcome.error().unwrap().kind, ErrorKind::Timeout);

        let steps = executor.tracker().steps(&id).unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.status == StepStatus::Aborted));
    }

    #[tokio::test]
    async fn test_step_store_failure_is_infrastructure() {
        let tracker = Arc::new(ExecutionTracker::new(Arc::new(FailingSteps::new(1))));
        let executor = SandboxExecutor::new(tracker, Arc::new(DependencyResolver::default()));
        let result = executor
            .execute(
                request(source("fn main(input) { return 1; }"), json!(null), ResourceLimits::default()),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result.outcome.status(), ExecutionStatus::Failed);
        let error = result.outcome.error().unwrap();
        assert_eq!(error.kind, ErrorKind::Infrastructure);
        assert!(error.message.contains("disk full"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_preempted() {
        let executor = executor();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = executor
            .execute(
                request(source("fn main(input) { return 1; }"), json!(null), ResourceLimits::default()),
                cancel,
            )
            .await;

        assert_eq!(result.outcome.status(), ExecutionStatus::Failed);
        let error = result.outcome.error().unwrap();
        assert_eq!(error.kind, ErrorKind::Infrastructure);
        assert_eq!(error.message, PREEMPTED_REASON);
    }

    #[tokio::test]
    async fn test_recorded_payloads_count_against_memory() {
        let executor = executor();
        let limits = ResourceLimits {
            memory_limit_mb: Some(1),
            ..ResourceLimits::default()
        };
        let req = request(
            source(
                r#"
                fn g(s) { return 1; }
                fn main(input) {
                    let s = "x" * 300000;
                    for i in range(200) { g(s); }
                    return 1;
                }
                "#,
            ),
            json!(null),
            limits,
        );
        let id = req.execution_id.clone();
        let result = executor.execute(req, CancellationToken::new()).await;

        assert_eq!(result.outcome.status(), ExecutionStatus::Failed);
        assert_eq!(result.outcome.error().unwrap().kind, ErrorKind::ResourceLimit);
        let steps = executor.tracker().steps(&id).unwrap();
        assert!(steps.len() < 5, "recorded {} steps", steps.len());
    }

    #[tokio::test]
    async fn test_memory_limit_is_resource_error() {
        let executor = executor();
        let limits = ResourceLimits {
            memory_limit_mb: Some(1),
            ..ResourceLimits::default()
        };
        let result = executor
            .execute(
                request(
                    source("fn main(input) { let s = \"x\" * 4000000; return len(s); }"),
                    json!(null),
                    limits,
                ),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.outcome.status(), ExecutionStatus::Failed);
        assert_eq!(result.outcome.error().unwrap().kind, ErrorKind::ResourceLimit);
    }

    #[tokio::test]
    async fn test_instruction_budget() {
        let executor = executor();
        let limits = ResourceLimits {
            max_instructions: Some(10_000),
            ..ResourceLimits::default()
        };
        let function = source("fn main(input) { let i = 0; while true { i = i + 1; } }").trusted();
        let result = executor
            .execute(request(function, json!(null), limits), CancellationToken::new())
            .await;
        assert_eq!(result.outcome.error().unwrap().kind, ErrorKind::ResourceLimit);
    }

    #[tokio::test]
    async fn test_preemption_fails_execution() {
        let executor = executor();
        let cancel = CancellationToken::new();
        let req = request(
            source("fn main(input) { sleep(5000); return 1; }"),
            json!(null),
            ResourceLimits::default(),
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let result = executor.execute(req, cancel).await;
        assert_eq!(result.outcome.error().unwrap().kind, ErrorKind::Infrastructure);
    }

    #[tokio::test]
    async fn test_concurrent_executions_have_disjoint_trees() {
        let executor = Arc::new(executor());
        let function = Arc::new(
            validate_and_instrument(source(
                "fn fib(n) { if n < 2 { return n; } return fib(n - 1) + fib(n - 2); } \
                 fn main(input) { return fib(input); }",
            ))
            .unwrap(),
        );

        let runs = (0..8).map(|n| {
            let executor = executor.clone();
            let req = ExecutionRequest {
                execution_id: format!("exec-{}", n),
                function: function.clone(),
                library: Library::new(),
                input: Value::Int(n),
                context: Value::Null,
                limits: ResourceLimits::default(),
            };
            async move { executor.execute(req, CancellationToken::new()).await }
        });
        let results = futures::future::join_all(runs).await;

        for (n, result) in results.into_iter().enumerate() {
            assert_eq!(result.outcome.status(), ExecutionStatus::Completed);
            let id = format!("exec-{}", n);
            let steps = executor.tracker().steps(&id).unwrap();
            assert!(steps.iter().all(|s| s.execution_id == id));
            validate_tree(&id, &steps).unwrap();
        }
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = ExecutionOutcome::Timeout {
            error: ExecutionError::new(ErrorKind::Timeout, "slow"),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "timeout");
        let back: ExecutionOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
    }
}
