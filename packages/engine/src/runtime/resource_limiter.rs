// packages/engine/src/runtime/resource_limiter.rs
//! Resource limits for executions
//!
//! Provides control over:
//! - Wall-clock time (per execution)
//! - Memory held by live interpreter values (MB)
//! - CPU: instruction budget in-process, cgroup quota for worker processes
//! - Call depth

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Deepest call depth accepted by [`ResourceLimits::validate`]
///
/// Bounded by the interpreter thread stack.
pub const MAX_CALL_DEPTH_CEILING: u32 = 2048;

/// Limits applied to one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock timeout in milliseconds
    pub wall_clock_ms: u64,

    /// Memory ceiling in megabytes
    /// Example: 512 = 512MB of live values
    pub memory_limit_mb: Option<u64>,

    /// CPU quota as percentage (0-400, 100 = one core); applied to worker
    /// processes through cgroups
    pub cpu_quota: Option<u32>,

    /// Interpreter instruction budget
    pub max_instructions: Option<u64>,

    /// Maximum nesting of intercepted calls
    pub max_call_depth: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_clock_ms: 300_000,     // 5 minutes
            memory_limit_mb: Some(512), // 512MB
            cpu_quota: None,
            max_instructions: None,
            max_call_depth: 256,
        }
    }
}

impl ResourceLimits {
    /// Limits with no memory, CPU or instruction restriction
    pub fn unlimited() -> Self {
        Self {
            memory_limit_mb: None,
            cpu_quota: None,
            max_instructions: None,
            max_call_depth: MAX_CALL_DEPTH_CEILING,
            ..Self::default()
        }
    }

    /// Tight limits for untrusted code
    pub fn strict() -> Self {
        Self {
            wall_clock_ms: 30_000,
            memory_limit_mb: Some(128),
            cpu_quota: Some(25),
            max_instructions: Some(10_000_000),
            max_call_depth: 64,
        }
    }

    /// Generous limits for development
    pub fn relaxed() -> Self {
        Self {
            wall_clock_ms: 900_000,
            memory_limit_mb: Some(2048),
            cpu_quota: Some(100),
            max_instructions: None,
            max_call_depth: 1024,
        }
    }

    pub fn wall_clock(&self) -> Duration {
        Duration::from_millis(self.wall_clock_ms)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.wall_clock_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    /// Validate resource limits
    pub fn validate(&self) -> Result<(), String> {
        if self.wall_clock_ms == 0 {
            return Err("Wall-clock timeout cannot be 0".to_string());
        }

        if let Some(quota) = self.cpu_quota {
            if quota == 0 {
                return Err("CPU quota cannot be 0".to_string());
            }
            if quota > 400 {
                return Err("CPU quota cannot exceed 400% (4 cores)".to_string());
            }
        }

        if let Some(memory) = self.memory_limit_mb {
            if memory == 0 {
                return Err("Memory limit cannot be 0".to_string());
            }
            if memory > 16384 {
                return Err("Memory limit cannot exceed 16GB".to_string());
            }
        }

        if self.max_instructions == Some(0) {
            return Err("Instruction budget cannot be 0".to_string());
        }

        if self.max_call_depth == 0 || self.max_call_depth > MAX_CALL_DEPTH_CEILING {
            return Err(format!(
                "Call depth must be between 1 and {}",
                MAX_CALL_DEPTH_CEILING
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.wall_clock(), Duration::from_secs(300));
        assert_eq!(limits.memory_limit_mb, Some(512));
        assert_eq!(limits.max_call_depth, 256);
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(ResourceLimits::strict().validate().is_ok());
        assert!(ResourceLimits::relaxed().validate().is_ok());
        assert!(ResourceLimits::unlimited().validate().is_ok());
        assert!(ResourceLimits::unlimited().memory_limit_mb.is_none());
    }

    #[test]
    fn test_validation() {
        let invalid_cpu = ResourceLimits {
            cpu_quota: Some(0),
            ..Default::default()
        };
        assert!(invalid_cpu.validate().is_err());

        let invalid_depth = ResourceLimits {
            max_call_depth: MAX_CALL_DEPTH_CEILING + 1,
            ..Default::default()
        };
        assert!(invalid_depth.validate().is_err());

        let invalid_timeout = ResourceLimits::default().with_timeout(Duration::ZERO);
        assert!(invalid_timeout.validate().is_err());
    }
}
