// packages/engine/src/lib.rs
//! fnrt Function Execution Runtime
//!
//! Users submit small functions in a restricted scripting language. The
//! engine validates and instruments them once, then runs each invocation in
//! a sandbox or on a shared worker pool while recording the full call tree.
//!
//! # Architecture
//!
//! - **script**: parser, static validator, instrumentation and interpreter
//! - **functions**: stored definitions and the active registry
//! - **runtime**: sandbox executor, worker backends and the elastic pool
//! - **tracking**: execution/step records and their stores
//! - **service**: the single invocation entry point
//! - **triggers**: cron schedules and boot manifests
//! - **api**: HTTP control surface
//! - **security**: permission patterns for API callers
//! - **codec**: tagged values and the versioned wire envelope
//! - **observability**: tracing and Prometheus metrics
//! - **utils**: configuration, errors and helpers

pub mod api;
pub mod codec;
pub mod functions;
pub mod observability;
pub mod runtime;
pub mod script;
pub mod security;
pub mod service;
pub mod tracking;
pub mod triggers;
pub mod utils;

pub use service::{FunctionRuntime, Invoker};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert_eq!(info.version, VERSION);
        assert!(!info.git_hash.is_empty());
    }
}
