// packages/engine/src/observability/mod.rs
//! Tracing and metrics setup
//!
//! Logs go through `tracing` with an `EnvFilter` (`RUST_LOG` overrides the
//! configured level). Metrics are recorded with the `metrics` facade and
//! rendered in Prometheus text format by the HTTP control surface.

use crate::utils::config::{LogFormat, ObservabilityConfig};
use anyhow::{anyhow, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Metric names shared across the engine
pub mod names {
    pub const EXECUTIONS_TOTAL: &str = "fnrt_executions_total";
    pub const EXECUTION_DURATION_MS: &str = "fnrt_execution_duration_ms";
    pub const STEPS_TOTAL: &str = "fnrt_steps_total";
    pub const WORKERS: &str = "fnrt_workers";
    pub const DISPATCH_TOTAL: &str = "fnrt_dispatch_total";
    pub const WORKER_START_FAILURES_TOTAL: &str = "fnrt_worker_start_failures_total";
}

/// Initialize the global tracing subscriber.
///
/// Worker processes pass `to_stderr = true`: their stdout carries the
/// host/worker protocol and must not contain log lines.
pub fn init_tracing(config: &ObservabilityConfig, to_stderr: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| anyhow!("invalid log filter: {}", e))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = match (config.log_format, to_stderr) {
        (LogFormat::Json, true) => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        (LogFormat::Json, false) => registry.with(fmt::layer().json()).try_init(),
        (LogFormat::Pretty, true) => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        (LogFormat::Pretty, false) => registry.with(fmt::layer()).try_init(),
    };

    result.map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

/// Install the Prometheus recorder; returns the handle used to render `/metrics`
pub fn init_metrics(config: &ObservabilityConfig) -> Result<Option<PrometheusHandle>> {
    if !config.metrics_enabled {
        return Ok(None);
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow!("failed to install metrics recorder: {}", e))?;

    describe_metrics();
    Ok(Some(handle))
}

fn describe_metrics() {
    metrics::describe_counter!(names::EXECUTIONS_TOTAL, "Executions by terminal status");
    metrics::describe_histogram!(
        names::EXECUTION_DURATION_MS,
        "Wall-clock duration of executions in milliseconds"
    );
    metrics::describe_counter!(names::STEPS_TOTAL, "Step executions recorded");
    metrics::describe_gauge!(names::WORKERS, "Workers in the pool by status");
    metrics::describe_counter!(names::DISPATCH_TOTAL, "Executions dispatched to workers");
    metrics::describe_counter!(
        names::WORKER_START_FAILURES_TOTAL,
        "Worker start attempts that failed"
    );
}
