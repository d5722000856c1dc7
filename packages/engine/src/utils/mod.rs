// packages/engine/src/utils/mod.rs
//! Common utilities: errors, configuration, retry backoff

pub mod backoff;
pub mod config;
pub mod errors;

pub use backoff::Backoff;
pub use config::EngineConfig;
pub use errors::{EngineError, Result, SourceLocation, ValidationError};
