// packages/engine/src/runtime/mod.rs
//! Function execution runtime
//!
//! This module runs instrumented functions, including:
//!
//! - **Sandbox**: In-process execution under a wall clock, instruction and
//!   memory budget, with schema checks on input and output
//! - **Dependencies**: Package requirements resolved before a run
//! - **Worker Pool**: Elastic pool of shared workers with round-robin dispatch
//! - **Backends**: In-process workers or one OS process per worker
//! - **Protocol**: Line-delimited envelopes between host and worker processes
//! - **Isolation**: cgroup CPU and memory limits for worker processes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WorkerPool                          │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐               │
//! │  │ worker-1 │  │ worker-2 │  │ worker-3 │  ...          │
//! │  │ executor │  │ executor │  │ executor │               │
//! │  └──────────┘  └──────────┘  └──────────┘               │
//! │         ▲            ▲            ▲                     │
//! │         └────────────┴────────────┘                     │
//! │                      │                                  │
//! │           round-robin over eligible snapshot            │
//! │                      │                                  │
//! │         shared-pool invocations (ExecuteJob)            │
//! └─────────────────────────────────────────────────────────┘
//!
//! per-caller invocations ──► SandboxExecutor (host process)
//! ```

pub mod backend;
pub mod dependencies;
pub mod isolation;
pub mod process_manager;
pub mod protocol;
pub mod resource_limiter;
pub mod sandbox;
pub mod worker_main;
pub mod worker_pool;

// Re-export commonly used types
pub use backend::{LocalBackend, ProcessBackend, Probe, WorkerBackend, WorkerHandle};
pub use dependencies::DependencyResolver;
pub use isolation::{CgroupLimiter, ProcessLimits};
pub use process_manager::{ProcessManager, SpawnConfig};
pub use protocol::{ExecuteJob, HostMessage, JobResult, WorkerMessage};
pub use resource_limiter::ResourceLimits;
pub use sandbox::{
    ExecutionOutcome, ExecutionRequest, ExecutionResult, SandboxExecutor, PREEMPTED_REASON,
};
pub use worker_main::run_worker;
pub use worker_pool::{HealthReport, ScaleReport, WorkerInfo, WorkerLease, WorkerPool, WorkerStatus};
