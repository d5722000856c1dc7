// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Configuration is layered: built-in defaults, then an optional file
//! (`fnrt.toml`, `fnrt.yaml`, ...), then environment variables of the form
//! `FNRT__SECTION__KEY` (for example `FNRT__POOL__MAX_WORKERS=16`).

use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub execution: ExecutionConfig,
    pub pool: PoolConfig,
    pub storage: StorageConfig,
    pub observability: ObservabilityConfig,
    pub permissions: PermissionsConfig,

    /// Optional YAML manifest with functions and schedules to preload
    pub manifest: Option<PathBuf>,
}

/// HTTP control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Maximum accepted request body (bytes)
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8700,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Per-execution limits and dependency policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Wall-clock timeout in seconds (default: 300)
    pub timeout_secs: u64,

    /// Memory ceiling in MB (default: 512)
    pub memory_limit_mb: u64,

    /// CPU quota as percentage of one core, applied to worker processes
    pub cpu_quota: Option<u32>,

    /// Interpreter instruction budget per execution
    pub max_instructions: Option<u64>,

    /// Maximum nested call depth
    pub max_call_depth: u32,

    /// Whether functions may declare packages to install
    pub allow_package_install: bool,

    /// Packages that can be installed on request
    pub available_packages: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            memory_limit_mb: 512,
            cpu_quota: None,
            max_instructions: None,
            max_call_depth: 256,
            allow_package_install: false,
            available_packages: vec!["regex".to_string(), "base64".to_string()],
        }
    }
}

impl ExecutionConfig {
    /// Default resource limits derived from this configuration
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            wall_clock_ms: self.timeout_secs.saturating_mul(1000),
            memory_limit_mb: Some(self.memory_limit_mb),
            cpu_quota: self.cpu_quota,
            max_instructions: self.max_instructions,
            max_call_depth: self.max_call_depth,
        }
    }
}

/// Which worker implementation backs the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerBackendKind {
    /// In-process workers (development, tests)
    Local,
    /// One OS process per worker
    Process,
}

/// Worker pool sizing and lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub backend: WorkerBackendKind,

    /// Inclusive lower bound for scale targets
    pub min_workers: usize,

    /// Inclusive upper bound for scale targets
    pub max_workers: usize,

    /// Workers started by `start()`
    pub default_workers: usize,

    /// How long scale-down waits for in-flight executions
    pub drain_timeout_secs: u64,

    /// How long a new worker may take to report ready
    pub ready_timeout_secs: u64,

    /// Start attempts before a worker is marked missing
    pub start_attempts: u32,

    /// Interval between periodic health checks
    pub health_interval_secs: u64,

    /// Worker executable (process backend); defaults to the current binary
    pub worker_command: Option<PathBuf>,

    /// Memory limit applied to each worker process (MB)
    pub worker_memory_limit_mb: u64,

    /// CPU quota applied to each worker process (percent of one core)
    pub worker_cpu_quota: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backend: WorkerBackendKind::Local,
            min_workers: 0,
            max_workers: 10,
            default_workers: 0,
            drain_timeout_secs: 30,
            ready_timeout_secs: 10,
            start_attempts: 3,
            health_interval_secs: 15,
            worker_command: None,
            worker_memory_limit_mb: 1024,
            worker_cpu_quota: 100,
        }
    }
}

impl PoolConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

/// Which execution store to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,

    /// SQLite database file
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Sqlite,
            path: PathBuf::from("fnrt.db"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,

    /// Default filter when `RUST_LOG` is unset
    pub log_level: String,

    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            log_level: "info".to_string(),
            metrics_enabled: true,
        }
    }
}

/// Principal → permission patterns
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    pub grants: HashMap<String, Vec<String>>,
}

impl EngineConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("fnrt").required(false)),
        };

        let config: EngineConfig = builder
            .add_source(
                config::Environment::with_prefix("FNRT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.pool.min_workers > self.pool.max_workers {
            return Err(EngineError::Config(format!(
                "pool.min_workers ({}) exceeds pool.max_workers ({})",
                self.pool.min_workers, self.pool.max_workers
            )));
        }
        if self.pool.default_workers < self.pool.min_workers
            || self.pool.default_workers > self.pool.max_workers
        {
            return Err(EngineError::Config(format!(
                "pool.default_workers ({}) must be within [{}, {}]",
                self.pool.default_workers, self.pool.min_workers, self.pool.max_workers
            )));
        }
        if self.pool.start_attempts == 0 {
            return Err(EngineError::Config(
                "pool.start_attempts must be at least 1".to_string(),
            ));
        }
        self.execution
            .limits()
            .validate()
            .map_err(EngineError::Config)?;
        Ok(())
    }
}
