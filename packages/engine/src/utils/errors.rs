// packages/engine/src/utils/errors.rs
//! Engine error taxonomy
//!
//! Every fallible operation in the engine returns [`EngineError`]. Errors raised
//! by user code inside a sandboxed run never surface here; they are captured as
//! [`crate::tracking::ExecutionError`] on the execution record instead.

use crate::tracking::model::ErrorKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Position inside submitted source code (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl SourceLocation {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Rejected source code: a syntax error or a construct outside the allow-list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub reason: String,
    pub location: Option<SourceLocation>,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>, location: Option<SourceLocation>) -> Self {
        Self {
            reason: reason.into(),
            location,
        }
    }

    pub fn at(reason: impl Into<String>, location: SourceLocation) -> Self {
        Self::new(reason, Some(location))
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{} ({})", self.reason, loc),
            None => f.write_str(&self.reason),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("Execution timed out after {0} ms")]
    Timeout(u64),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("Dependency resolution failed: {0}")]
    Dependency(String),

    #[error("No eligible worker available")]
    WorkerUnavailable,

    #[error("Scale target {target} is outside the allowed range [{min}, {max}]")]
    OutOfRange { target: i64, min: usize, max: usize },

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tracking error: {0}")]
    Tracking(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Persisted error kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::SchemaValidation(_) => ErrorKind::SchemaValidation,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::ResourceLimit(_) => ErrorKind::ResourceLimit,
            EngineError::Dependency(_) => ErrorKind::Dependency,
            EngineError::WorkerUnavailable => ErrorKind::WorkerUnavailable,
            EngineError::OutOfRange { .. } => ErrorKind::OutOfRange,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Infrastructure,
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::at("call to 'eval' is not allowed", SourceLocation::new(3, 9));
        assert_eq!(
            err.to_string(),
            "call to 'eval' is not allowed (line 3, column 9)"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(EngineError::WorkerUnavailable.kind(), ErrorKind::WorkerUnavailable);
        assert_eq!(
            EngineError::OutOfRange { target: 11, min: 0, max: 10 }.kind(),
            ErrorKind::OutOfRange
        );
        assert_eq!(
            EngineError::Storage("disk".into()).kind(),
            ErrorKind::Infrastructure
        );
    }
}
