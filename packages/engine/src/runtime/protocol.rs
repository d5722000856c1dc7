// packages/engine/src/runtime/protocol.rs
//! Host ↔ worker protocol
//!
//! One message per line, each wrapped in the versioned wire envelope. The
//! host sends [`HostMessage`]s on the worker's stdin; the worker answers with
//! [`WorkerMessage`]s on stdout. Results are matched to jobs by execution id,
//! so a worker may run several jobs at once.

use crate::codec::{self, Value};
use crate::functions::Function;
use crate::runtime::resource_limiter::ResourceLimits;
use crate::runtime::sandbox::{ExecutionOutcome, ExecutionRequest, ExecutionResult, SandboxExecutor};
use crate::script::{self, Library};
use crate::tracking::{ErrorKind, ExecutionError, StepExecution};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::codec::LinesCodec;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Longest accepted protocol line
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

pub fn line_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_BYTES)
}

/// An execution shipped to a worker
///
/// Functions travel as source definitions and are validated and
/// instrumented again on the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteJob {
    pub execution_id: String,
    pub function: Function,
    #[serde(default)]
    pub library: Vec<Function>,
    pub input: Value,
    pub context: Value,
    pub limits: ResourceLimits,
}

/// What came back from a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub execution_id: String,
    pub result: ExecutionResult,
    /// Call tree recorded on the worker
    pub steps: Vec<StepExecution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Ping { nonce: u64 },
    Execute { job: Box<ExecuteJob> },
    /// Preempt one running job; its result still comes back
    Cancel { execution_id: String },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready { worker_id: String, pid: u32 },
    Pong { nonce: u64 },
    Result { result: Box<JobResult> },
}

pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    codec::encode(message)
}

pub fn decode_line<T: serde::de::DeserializeOwned>(line: &str) -> Result<T> {
    codec::decode(line)
}

/// Rebuild the instrumented function and its library from source definitions
fn instantiate(job: &ExecuteJob) -> Result<(Arc<script::InstrumentedFunction>, Library)> {
    let function = Arc::new(script::validate_and_instrument(job.function.clone())?);
    let mut library = Library::new();
    for definition in &job.library {
        library.insert(Arc::new(script::validate_and_instrument(definition.clone())?));
    }
    Ok((function, library))
}

/// Run a job on `executor` and collect the call tree it produced
///
/// The executor's tracker is only a staging area: steps are drained from it
/// and returned with the result.
pub async fn run_job(executor: &SandboxExecutor, job: ExecuteJob, cancel: CancellationToken) -> JobResult {
    let execution_id = job.execution_id.clone();

    let result = match instantiate(&job) {
        Ok((function, library)) => {
            let request = ExecutionRequest {
                execution_id: execution_id.clone(),
                function,
                library,
                input: job.input,
                context: job.context,
                limits: job.limits,
            };
            executor.execute(request, cancel).await
        }
        Err(e) => ExecutionResult {
            outcome: ExecutionOutcome::failed(ExecutionError::new(
                ErrorKind::Validation,
                format!("worker rejected function: {}", e),
            )),
            duration_ms: 0,
        },
    };

    let store = executor.tracker().store();
    let steps = store.steps(&execution_id).unwrap_or_else(|e| {
        warn!(execution_id = %execution_id, error = %e, "failed to collect steps");
        Vec::new()
    });
    if let Err(e) = store.delete_steps(&execution_id) {
        warn!(execution_id = %execution_id, error = %e, "failed to drop staged steps");
    }

    JobResult {
        execution_id,
        result,
        steps,
    }
}

/// Error for a job whose worker went away
pub fn worker_lost(worker_id: &str) -> EngineError {
    EngineError::Infrastructure(format!("worker {} exited during execution", worker_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::dependencies::DependencyResolver;
    use crate::tracking::{validate_tree, ExecutionTracker, MemoryStore};

    fn job(function: Function, library: Vec<Function>, input: Value) -> ExecuteJob {
        ExecuteJob {
            execution_id: "exec-1".to_string(),
            function,
            library,
            input,
            context: Value::Null,
            limits: ResourceLimits::default(),
        }
    }

    #[test]
    fn test_messages_are_single_lines() {
        let message = HostMessage::Execute {
            job: Box::new(job(
                Function::new("ns", "f", "fn f(x) {\n  return x;\n}"),
                vec![],
                Value::str("multi\nline"),
            )),
        };
        let line = encode_line(&message).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(decode_line::<HostMessage>(&line).unwrap(), message);
    }

    #[test]
    fn test_tagged_message_shape() {
        let line = encode_line(&WorkerMessage::Pong { nonce: 7 }).unwrap();
        assert_eq!(line, r#"{"version":1,"body":{"type":"pong","nonce":7}}"#);
    }

    #[tokio::test]
    async fn test_run_job_ships_steps() {
        let tracker = Arc::new(ExecutionTracker::new(Arc::new(MemoryStore::new())));
        let executor = SandboxExecutor::new(tracker.clone(), Arc::new(DependencyResolver::default()));

        let helper = Function::new("lib", "twice", "fn twice(x) { return x * 2; }");
        let main = Function::new("app", "main", "fn main(input) { return lib::twice(input) + 1; }")
            .enable_namespace("lib");
        let result = run_job(&executor, job(main, vec![helper], Value::Int(4)), CancellationToken::new()).await;

        assert_eq!(
            result.result.outcome,
            ExecutionOutcome::Completed { output: Value::Int(9) }
        );
        assert_eq!(result.steps.len(), 2);
        validate_tree("exec-1", &result.steps).unwrap();
        // Staged steps are gone once shipped
        assert!(tracker.steps("exec-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_job_fails_without_steps() {
        let tracker = Arc::new(ExecutionTracker::new(Arc::new(MemoryStore::new())));
        let executor = SandboxExecutor::new(tracker, Arc::new(DependencyResolver::default()));
        let result = run_job(
            &executor,
            job(Function::new("app", "main", "fn main( {"), vec![], Value::Null),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(
            result.result.outcome.error().map(|e| e.kind),
            Some(ErrorKind::Validation)
        );
        assert!(result.steps.is_empty());
    }
}
