// packages/engine/src/tracking/tracker.rs
//! Execution tracker
//!
//! Builds the call tree of every running execution. Intercepted calls open a
//! step under the caller's [`TrackingContext`] and close it through the
//! [`StepHandle`] they got back. Handles are consumed on close, and the open
//! set is the single source of truth for what may still be finalised, so a
//! step is closed exactly once even when a timeout races the call.

use crate::codec::Value;
use crate::observability::names;
use crate::tracking::model::*;
use crate::tracking::storage::ExecutionStore;
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where in the call tree the current code runs
///
/// Passed explicitly through every call. Branches of `parallel` receive
/// clones of the same context and therefore become siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingContext {
    pub execution_id: String,
    pub current_step_id: Option<String>,
    pub depth: u32,
}

impl TrackingContext {
    /// Context of the code that starts an execution (no step yet)
    pub fn root(execution_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            current_step_id: None,
            depth: 0,
        }
    }

    /// Depth a step opened from this context will have
    pub fn child_depth(&self) -> u32 {
        match self.current_step_id {
            Some(_) => self.depth + 1,
            None => 0,
        }
    }
}

/// Proof that a step is open; consumed when it is closed
#[derive(Debug)]
pub struct StepHandle {
    execution_id: String,
    step_id: String,
    depth: u32,
}

impl StepHandle {
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Context for calls made from inside this step
    pub fn child_context(&self) -> TrackingContext {
        TrackingContext {
            execution_id: self.execution_id.clone(),
            current_step_id: Some(self.step_id.clone()),
            depth: self.depth,
        }
    }
}

#[derive(Default)]
struct TreeState {
    root: Mutex<Option<String>>,
    /// Next ordinal per parent step
    ordinals: DashMap<String, u32>,
    /// Open steps and their depth
    open: DashMap<String, u32>,
}

pub struct ExecutionTracker {
    store: Arc<dyn ExecutionStore>,
    trees: DashMap<String, Arc<TreeState>>,
}

impl ExecutionTracker {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            trees: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Start accepting steps for an execution
    pub fn open_execution(&self, execution_id: &str) {
        self.trees
            .entry(execution_id.to_string())
            .or_insert_with(|| Arc::new(TreeState::default()));
    }

    pub fn is_open(&self, execution_id: &str) -> bool {
        self.trees.contains_key(execution_id)
    }

    fn tree(&self, execution_id: &str) -> Result<Arc<TreeState>> {
        self.trees
            .get(execution_id)
            .map(|t| t.clone())
            .ok_or_else(|| {
                EngineError::Tracking(format!("execution {} is not being tracked", execution_id))
            })
    }

    /// Open a step under `ctx` and persist it as `running`
    pub fn begin_step(
        &self,
        ctx: &TrackingContext,
        function_ref: &str,
        args: Vec<Value>,
    ) -> Result<StepHandle> {
        let tree = self.tree(&ctx.execution_id)?;
        let step_id = ulid::Ulid::new().to_string();
        let step = |ordinal, depth| StepExecution {
            id: step_id.clone(),
            execution_id: ctx.execution_id.clone(),
            parent_step_id: ctx.current_step_id.clone(),
            function_ref: function_ref.to_string(),
            args,
            result: None,
            error: None,
            status: StepStatus::Running,
            ordinal,
            depth,
            started_at: Utc::now(),
            ended_at: None,
        };

        // Slots are claimed only once the insert succeeded, so a failed insert
        // leaves neither a second root nor an ordinal gap
        let (ordinal, depth) = match &ctx.current_step_id {
            None => {
                let mut root = tree.root.lock();
                if root.is_some() {
                    return Err(EngineError::Tracking(format!(
                        "execution {} already has a root step",
                        ctx.execution_id
                    )));
                }
                self.store.insert_step(&step(0, 0))?;
                *root = Some(step_id.clone());
                (0, 0)
            }
            Some(parent) => {
                let parent_depth = *tree.open.get(parent).ok_or_else(|| {
                    EngineError::Tracking(format!("parent step {} is not open", parent))
                })?;
                let mut next = tree.ordinals.entry(parent.clone()).or_insert(0);
                let ordinal = *next;
                self.store.insert_step(&step(ordinal, parent_depth + 1))?;
                *next += 1;
                (ordinal, parent_depth + 1)
            }
        };

        tree.open.insert(step_id.clone(), depth);

        // Lost a race with close_execution: the sweep may have missed this step
        if !self.is_open(&ctx.execution_id) && tree.open.remove(&step_id).is_some() {
            let outcome = StepOutcome::Aborted("execution closed".to_string());
            self.store
                .finish_step(&ctx.execution_id, &step_id, &outcome, Utc::now())?;
            return Err(EngineError::Tracking(format!(
                "execution {} closed while opening a step",
                ctx.execution_id
            )));
        }

        debug!(
            execution_id = %ctx.execution_id,
            step_id = %step_id,
            function_ref,
            depth,
            ordinal,
            "step opened"
        );

        Ok(StepHandle {
            execution_id: ctx.execution_id.clone(),
            step_id,
            depth,
        })
    }

    /// Close a step. Fails if the step was already closed (for example aborted
    /// by [`close_execution`](Self::close_execution)).
    pub fn end_step(&self, handle: StepHandle, outcome: StepOutcome) -> Result<()> {
        let tree = self.tree(&handle.execution_id)?;
        if tree.open.remove(&handle.step_id).is_none() {
            return Err(EngineError::Tracking(format!(
                "step {} is no longer open",
                handle.step_id
            )));
        }

        self.store
            .finish_step(&handle.execution_id, &handle.step_id, &outcome, Utc::now())?;
        metrics::counter!(names::STEPS_TOTAL, "status" => outcome.status().as_str()).increment(1);

        debug!(
            execution_id = %handle.execution_id,
            step_id = %handle.step_id,
            status = %outcome.status(),
            "step closed"
        );
        Ok(())
    }

    /// Stop tracking an execution, aborting every step still open
    ///
    /// Returns the number of aborted steps.
    pub fn close_execution(&self, execution_id: &str, reason: &str) -> Result<usize> {
        let Some((_, tree)) = self.trees.remove(execution_id) else {
            return Ok(0);
        };

        let open: Vec<String> = tree.open.iter().map(|e| e.key().clone()).collect();
        let mut aborted = 0;
        for step_id in open {
            if tree.open.remove(&step_id).is_none() {
                continue;
            }
            let outcome = StepOutcome::Aborted(reason.to_string());
            match self
                .store
                .finish_step(execution_id, &step_id, &outcome, Utc::now())
            {
                Ok(()) => aborted += 1,
                Err(e) => warn!(execution_id, step_id = %step_id, error = %e, "failed to abort step"),
            }
        }

        if aborted > 0 {
            debug!(execution_id, aborted, reason, "aborted open steps");
        }
        Ok(aborted)
    }

    /// Persist a call tree recorded elsewhere (by a pooled worker)
    pub fn import_steps(&self, execution_id: &str, mut steps: Vec<StepExecution>) -> Result<()> {
        validate_tree(execution_id, &steps)?;
        steps.sort_by_key(|s| (s.depth, s.ordinal));
        for step in &steps {
            self.store.insert_step(step)?;
        }
        Ok(())
    }

    pub fn steps(&self, execution_id: &str) -> Result<Vec<StepExecution>> {
        self.store.steps(execution_id)
    }
}

/// Check that `steps` form one well-shaped, fully closed call tree
pub fn validate_tree(execution_id: &str, steps: &[StepExecution]) -> Result<()> {
    let invalid = |msg: String| EngineError::Tracking(format!("invalid call tree: {}", msg));
    if steps.is_empty() {
        return Ok(());
    }

    let mut by_id: HashMap<&str, &StepExecution> = HashMap::with_capacity(steps.len());
    for step in steps {
        if step.execution_id != execution_id {
            return Err(invalid(format!(
                "step {} belongs to execution {}",
                step.id, step.execution_id
            )));
        }
        if step.status == StepStatus::Running {
            return Err(invalid(format!("step {} is still running", step.id)));
        }
        if by_id.insert(step.id.as_str(), step).is_some() {
            return Err(invalid(format!("duplicate step id {}", step.id)));
        }
    }

    let roots: Vec<&StepExecution> = steps.iter().filter(|s| s.parent_step_id.is_none()).collect();
    match roots.as_slice() {
        [root] if root.depth == 0 && root.ordinal == 0 => {}
        [root] => {
            return Err(invalid(format!(
                "root step {} has depth {} and ordinal {}",
                root.id, root.depth, root.ordinal
            )))
        }
        _ => return Err(invalid(format!("expected one root step, found {}", roots.len()))),
    }

    let mut children: HashMap<&str, Vec<u32>> = HashMap::new();
    for step in steps {
        let Some(parent_id) = step.parent_step_id.as_deref() else {
            continue;
        };
        let parent = by_id
            .get(parent_id)
            .ok_or_else(|| invalid(format!("step {} has unknown parent {}", step.id, parent_id)))?;
        if step.depth != parent.depth + 1 {
            return Err(invalid(format!(
                "step {} has depth {} under a parent of depth {}",
                step.id, step.depth, parent.depth
            )));
        }
        children.entry(parent_id).or_default().push(step.ordinal);
    }

    for (parent, mut ordinals) in children {
        ordinals.sort_unstable();
        let contiguous = ordinals.iter().enumerate().all(|(i, o)| *o as usize == i);
        if !contiguous {
            return Err(invalid(format!(
                "children of {} have ordinals {:?}",
                parent, ordinals
            )));
        }
    }

    Ok(())
}
