// packages/engine/src/tracking/storage.rs
//! Engine-agnostic execution storage
//!
//! The tracker only talks to [`ExecutionStore`]. Implementations enforce the
//! record lifecycle themselves: an execution reaches a terminal status exactly
//! once and a step is finalised only from `running`.

use crate::tracking::model::*;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;

/// Durable home of executions and their steps
pub trait ExecutionStore: Send + Sync {
    fn insert_execution(&self, execution: &Execution) -> Result<()>;

    /// `pending → running`
    fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<()>;

    fn set_worker(&self, id: &str, worker_id: &str) -> Result<()>;

    /// Record the terminal status (exactly once)
    fn complete_execution(&self, id: &str, completion: &Completion) -> Result<()>;

    fn get_execution(&self, id: &str) -> Result<Option<Execution>>;

    /// Most recent first
    fn list_executions(&self, function_ref: Option<&str>, limit: usize) -> Result<Vec<Execution>>;

    fn insert_step(&self, step: &StepExecution) -> Result<()>;

    /// `running → {completed, failed, aborted}`
    fn finish_step(
        &self,
        execution_id: &str,
        step_id: &str,
        outcome: &StepOutcome,
        ended_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Steps of one execution in creation order
    fn steps(&self, execution_id: &str) -> Result<Vec<StepExecution>>;

    /// Drop the steps of one execution, returning how many were removed
    fn delete_steps(&self, execution_id: &str) -> Result<usize>;
}

pub(crate) fn transition_error(id: &str, from: ExecutionStatus, to: ExecutionStatus) -> EngineError {
    EngineError::Tracking(format!(
        "execution {} cannot move from {} to {}",
        id, from, to
    ))
}

pub(crate) fn step_not_running(step_id: &str, status: StepStatus) -> EngineError {
    EngineError::Tracking(format!(
        "step {} is already {} and cannot be finalised again",
        step_id, status
    ))
}

#[derive(Default)]
struct StepLog {
    steps: Vec<StepExecution>,
    index: HashMap<String, usize>,
}

/// In-memory store, used by tests and by in-process workers
#[derive(Default)]
pub struct MemoryStore {
    executions: DashMap<String, Execution>,
    steps: DashMap<String, StepLog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_execution<T>(&self, id: &str, f: impl FnOnce(&mut Execution) -> Result<T>) -> Result<T> {
        let mut execution = self
            .executions
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", id)))?;
        f(&mut execution)
    }
}

impl ExecutionStore for MemoryStore {
    fn insert_execution(&self, execution: &Execution) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.executions.entry(execution.id.clone()) {
            Entry::Occupied(_) => Err(EngineError::Tracking(format!(
                "execution {} already exists",
                execution.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(execution.clone());
                Ok(())
            }
        }
    }

    fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<()> {
        self.with_execution(id, |execution| {
            if !execution.status.can_transition_to(ExecutionStatus::Running) {
                return Err(transition_error(id, execution.status, ExecutionStatus::Running));
            }
            execution.status = ExecutionStatus::Running;
            execution.started_at = Some(started_at);
            Ok(())
        })
    }

    fn set_worker(&self, id: &str, worker_id: &str) -> Result<()> {
        self.with_execution(id, |execution| {
            execution.worker_id = Some(worker_id.to_string());
            Ok(())
        })
    }

    fn complete_execution(&self, id: &str, completion: &Completion) -> Result<()> {
        self.with_execution(id, |execution| {
            if !execution.status.can_transition_to(completion.status) {
                return Err(transition_error(id, execution.status, completion.status));
            }
            execution.status = completion.status;
            execution.output = completion.output.clone();
            execution.error = completion.error.clone();
            execution.ended_at = Some(completion.ended_at);
            execution.duration_ms = completion.duration_ms;
            Ok(())
        })
    }

    fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        Ok(self.executions.get(id).map(|e| e.clone()))
    }

    fn list_executions(&self, function_ref: Option<&str>, limit: usize) -> Result<Vec<Execution>> {
        let mut executions: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| function_ref.map_or(true, |f| e.function_ref == f))
            .map(|e| e.clone())
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        executions.truncate(limit);
        Ok(executions)
    }

    fn insert_step(&self, step: &StepExecution) -> Result<()> {
        let mut log = self.steps.entry(step.execution_id.clone()).or_default();
        if log.index.contains_key(&step.id) {
            return Err(EngineError::Tracking(format!("step {} already exists", step.id)));
        }
        let position = log.steps.len();
        log.index.insert(step.id.clone(), position);
        log.steps.push(step.clone());
        Ok(())
    }

    fn finish_step(
        &self,
        execution_id: &str,
        step_id: &str,
        outcome: &StepOutcome,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut log = self
            .steps
            .get_mut(execution_id)
            .ok_or_else(|| EngineError::NotFound(format!("steps of execution {}", execution_id)))?;
        let position = *log
            .index
            .get(step_id)
            .ok_or_else(|| EngineError::NotFound(format!("step {}", step_id)))?;

        let step = &mut log.steps[position];
        if step.status != StepStatus::Running {
            return Err(step_not_running(step_id, step.status));
        }
        outcome.apply(step, ended_at);
        Ok(())
    }

    fn steps(&self, execution_id: &str) -> Result<Vec<StepExecution>> {
        Ok(self
            .steps
            .get(execution_id)
            .map(|log| log.steps.clone())
            .unwrap_or_default())
    }

    fn delete_steps(&self, execution_id: &str) -> Result<usize> {
        Ok(self
            .steps
            .remove(execution_id)
            .map(|(_, log)| log.steps.len())
            .unwrap_or(0))
    }
}

/// Memory store whose next `n` step inserts fail
#[cfg(test)]
pub(crate) struct FailingSteps {
    inner: MemoryStore,
    failures: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FailingSteps {
    pub(crate) fn new(failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: std::sync::atomic::AtomicUsize::new(failures),
        }
    }

    pub(crate) fn fail_next(&self, n: usize) {
        self.failures.store(n, std::sync::atomic::Ordering::Release);
    }
}

#[cfg(test)]
impl ExecutionStore for FailingSteps {
    fn insert_execution(&self, execution: &Execution) -> Result<()> {
        self.inner.insert_execution(execution)
    }

    fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<()> {
        self.inner.mark_running(id, started_at)
    }

    fn set_worker(&self, id: &str, worker_id: &str) -> Result<()> {
        self.inner.set_worker(id, worker_id)
    }

    fn complete_execution(&self, id: &str, completion: &Completion) -> Result<()> {
        self.inner.complete_execution(id, completion)
    }

    fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        self.inner.get_execution(id)
    }

    fn list_executions(&self, function_ref: Option<&str>, limit: usize) -> Result<Vec<Execution>> {
        self.inner.list_executions(function_ref, limit)
    }

    fn insert_step(&self, step: &StepExecution) -> Result<()> {
        use std::sync::atomic::Ordering;
        let failed = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EngineError::Storage("disk full".to_string()));
        }
        self.inner.insert_step(step)
    }

    fn finish_step(
        &self,
        execution_id: &str,
        step_id: &str,
        outcome: &StepOutcome,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.finish_step(execution_id, step_id, outcome, ended_at)
    }

    fn steps(&self, execution_id: &str) -> Result<Vec<StepExecution>> {
        self.inner.steps(execution_id)
    }

    fn delete_steps(&self, execution_id: &str) -> Result<usize> {
        self.inner.delete_steps(execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;

    fn step(execution_id: &str, id: &str) -> StepExecution {
        StepExecution {
            id: id.to_string(),
            execution_id: execution_id.to_string(),
            parent_step_id: None,
            function_ref: "ns/f".to_string(),
            args: vec![Value::Int(1)],
            result: None,
            error: None,
            status: StepStatus::Running,
            ordinal: 0,
            depth: 0,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    #[test]
    fn test_terminal_status_set_once() {
        let store = MemoryStore::new();
        let execution = Execution::pending("ns/f", Value::Null, TriggerContext::manual());
        store.insert_execution(&execution).unwrap();
        store.mark_running(&execution.id, Utc::now()).unwrap();

        store
            .complete_execution(&execution.id, &Completion::completed(Value::Int(1)))
            .unwrap();
        let err = store
            .complete_execution(
                &execution.id,
                &Completion::failed(ExecutionError::new(ErrorKind::Runtime, "late")),
            )
            .unwrap_err();
        assert!(err.to_string().contains("cannot move from completed to failed"));

        let stored = store.get_execution(&execution.id).unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(stored.output, Some(Value::Int(1)));
    }

    #[test]
    fn test_step_finalised_once() {
        let store = MemoryStore::new();
        store.insert_step(&step("e1", "s1")).unwrap();

        store
            .finish_step("e1", "s1", &StepOutcome::Completed(Value::Int(2)), Utc::now())
            .unwrap();
        assert!(store
            .finish_step("e1", "s1", &StepOutcome::Aborted("late".into()), Utc::now())
            .is_err());

        let steps = store.steps("e1").unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[0].result, Some(Value::Int(2)));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let store = MemoryStore::new();
        store.insert_step(&step("e1", "s1")).unwrap();
        assert!(store.insert_step(&step("e1", "s1")).is_err());
    }

    #[test]
    fn test_list_filters_by_function() {
        let store = MemoryStore::new();
        for f in ["ns/a", "ns/b", "ns/a"] {
            store
                .insert_execution(&Execution::pending(f, Value::Null, TriggerContext::manual()))
                .unwrap();
        }
        assert_eq!(store.list_executions(Some("ns/a"), 10).unwrap().len(), 2);
        assert_eq!(store.list_executions(None, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_steps() {
        let store = MemoryStore::new();
        store.insert_step(&step("e1", "s1")).unwrap();
        store.insert_step(&step("e1", "s2")).unwrap();
        assert_eq!(store.delete_steps("e1").unwrap(), 2);
        assert!(store.steps("e1").unwrap().is_empty());
    }
}
