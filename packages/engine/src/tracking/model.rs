// packages/engine/src/tracking/model.rs
//! Execution and step records

use crate::codec::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of an execution: `pending → running → {completed, failed, timeout}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }

    /// Whether a record in this status may move to `next`
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            // Executions rejected before start (no worker, bad input) end from pending
            (Pending, Failed) => true,
            (Running, Completed | Failed | Timeout) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "aborted" => Ok(StepStatus::Aborted),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

/// What started an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Webhook,
    Schedule,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub kind: TriggerKind,

    /// Who asked (webhook caller, schedule owner)
    #[serde(default)]
    pub principal: Option<String>,

    /// Where it came from (request path, schedule name)
    #[serde(default)]
    pub source: Option<String>,

    pub fired_at: DateTime<Utc>,
}

impl TriggerContext {
    pub fn new(kind: TriggerKind) -> Self {
        Self {
            kind,
            principal: None,
            source: None,
            fired_at: Utc::now(),
        }
    }

    pub fn manual() -> Self {
        Self::new(TriggerKind::Manual)
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Persisted error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    SchemaValidation,
    Timeout,
    ResourceLimit,
    Dependency,
    WorkerUnavailable,
    OutOfRange,
    NotFound,
    /// Raised by user code
    Runtime,
    Infrastructure,
}

/// Structured error recorded on executions and steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,

    /// Type of the error raised by user code, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            error_type: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_type {
            Some(t) => write!(f, "{}: {}", t, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl From<&crate::utils::errors::EngineError> for ExecutionError {
    fn from(e: &crate::utils::errors::EngineError) -> Self {
        ExecutionError::new(e.kind(), e.to_string())
    }
}

/// One invocation of a function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub function_ref: String,
    pub status: ExecutionStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<ExecutionError>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub trigger: TriggerContext,
    pub worker_id: Option<String>,
    pub duration_ms: Option<u64>,
}

impl Execution {
    /// A fresh `pending` execution with a new id
    pub fn pending(function_ref: impl Into<String>, input: Value, trigger: TriggerContext) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            function_ref: function_ref.into(),
            status: ExecutionStatus::Pending,
            input,
            output: None,
            error: None,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
            trigger,
            worker_id: None,
            duration_ms: None,
        }
    }
}

/// One intercepted call inside an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: String,
    pub execution_id: String,
    pub parent_step_id: Option<String>,
    pub function_ref: String,
    pub args: Vec<Value>,
    pub result: Option<Value>,
    pub error: Option<ExecutionError>,
    pub status: StepStatus,

    /// Position among siblings, from 0
    pub ordinal: u32,

    /// Distance from the root step (root = 0)
    pub depth: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// How a step ended
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(Value),
    Failed(ExecutionError),
    Aborted(String),
}

impl StepOutcome {
    pub fn status(&self) -> StepStatus {
        match self {
            StepOutcome::Completed(_) => StepStatus::Completed,
            StepOutcome::Failed(_) => StepStatus::Failed,
            StepOutcome::Aborted(_) => StepStatus::Aborted,
        }
    }

    /// Apply to a running step record
    pub fn apply(&self, step: &mut StepExecution, ended_at: DateTime<Utc>) {
        step.status = self.status();
        step.ended_at = Some(ended_at);
        match self {
            StepOutcome::Completed(value) => step.result = Some(value.clone()),
            StepOutcome::Failed(error) => step.error = Some(error.clone()),
            StepOutcome::Aborted(reason) => {
                step.error = Some(ExecutionError::new(ErrorKind::Timeout, reason))
            }
        }
    }
}

/// Terminal update for an execution
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    pub error: Option<ExecutionError>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
}

impl Completion {
    pub fn completed(output: Value) -> Self {
        Self::new(ExecutionStatus::Completed, Some(output), None)
    }

    pub fn failed(error: ExecutionError) -> Self {
        Self::new(ExecutionStatus::Failed, None, Some(error))
    }

    pub fn timed_out(error: ExecutionError) -> Self {
        Self::new(ExecutionStatus::Timeout, None, Some(error))
    }

    fn new(status: ExecutionStatus, output: Option<Value>, error: Option<ExecutionError>) -> Self {
        Self {
            status,
            output,
            error,
            ended_at: Utc::now(),
            duration_ms: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// An execution with its call tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: Execution,
    pub steps: Vec<StepExecution>,
}
