// packages/engine/src/triggers/manifest.rs
//! Boot-time manifest of functions and schedules
//!
//! ```yaml
//! functions:
//!   - namespace: reports
//!     name: daily
//!     code: |
//!       fn daily(input) { return input; }
//! schedules:
//!   - name: nightly-report
//!     function_name: reports/daily
//!     cron_expression: "0 2 * * *"
//! ```

use crate::functions::{Function, FunctionRegistry};
use crate::triggers::scheduler::{Schedule, Scheduler};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub functions: Vec<Function>,
    pub schedules: Vec<Schedule>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub functions: usize,
    pub schedules: usize,
}

impl Manifest {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| EngineError::Config(format!("invalid manifest: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Register every function, then every schedule
    ///
    /// Stops at the first invalid entry; earlier entries stay registered.
    pub fn apply(self, registry: &FunctionRegistry, scheduler: &Scheduler) -> Result<Applied> {
        let mut applied = Applied::default();
        for function in self.functions {
            registry.register(function)?;
            applied.functions += 1;
        }
        for schedule in self.schedules {
            scheduler.register(schedule)?;
            applied.schedules += 1;
        }
        info!(
            functions = applied.functions,
            schedules = applied.schedules,
            "manifest applied"
        );
        Ok(applied)
    }
}
