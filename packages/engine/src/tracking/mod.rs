// packages/engine/src/tracking/mod.rs
//! Execution tracking
//!
//! Records every execution and the tree of intercepted calls made inside it.

pub mod model;
pub mod sqlite;
pub mod storage;
pub mod tracker;

pub use model::{
    Completion, ErrorKind, Execution, ExecutionDetail, ExecutionError, ExecutionStatus,
    StepExecution, StepOutcome, StepStatus, TriggerContext, TriggerKind,
};
pub use sqlite::SqliteStore;
pub use storage::{ExecutionStore, MemoryStore};
pub use tracker::{validate_tree, ExecutionTracker, StepHandle, TrackingContext};
