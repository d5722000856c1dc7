// packages/engine/src/runtime/isolation.rs
//! Process isolation for worker processes
//!
//! Provides:
//! - CPU limits (cgroups)
//! - Memory limits (cgroups)
//!
//! Both cgroup v2 (unified hierarchy) and v1 are supported. Failing to set a
//! limit is logged and not fatal: the worker still runs, and the in-process
//! budget keeps applying.

use tracing::{debug, warn};

/// Scheduling period used to express CPU quotas
const CPU_PERIOD_US: u64 = 100_000;

/// Limits applied to one worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    /// CPU quota (percentage of one core)
    pub cpu_quota: Option<u32>,

    /// Memory limit in MB
    pub memory_limit_mb: Option<u64>,
}

/// cgroup-based limiter for worker processes
#[derive(Debug, Clone)]
pub struct CgroupLimiter {
    root: std::path::PathBuf,
    prefix: String,
}

impl Default for CgroupLimiter {
    fn default() -> Self {
        Self::new("/sys/fs/cgroup", "fnrt-worker")
    }
}

impl CgroupLimiter {
    pub fn new(root: impl Into<std::path::PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    fn unified(&self) -> bool {
        self.root.join("cgroup.controllers").exists()
    }

    fn group_name(&self, pid: u32) -> String {
        format!("{}-{}", self.prefix, pid)
    }

    /// Apply resource limits to a process
    pub fn apply(&self, pid: u32, limits: ProcessLimits) {
        debug!("Applying resource limits to PID {}: {:?}", pid, limits);

        if cfg!(not(target_os = "linux")) {
            warn!("Process limits not supported on this platform");
            return;
        }

        if self.unified() {
            self.apply_unified(pid, limits);
        } else {
            self.apply_legacy(pid, limits);
        }
    }

    fn apply_unified(&self, pid: u32, limits: ProcessLimits) {
        let group = self.root.join(self.group_name(pid));
        if let Err(e) = std::fs::create_dir_all(&group) {
            warn!("Failed to create cgroup {:?}: {}", group, e);
            return;
        }

        if let Some(quota) = limits.cpu_quota {
            let max = (quota as u64 * CPU_PERIOD_US) / 100;
            write_control(&group.join("cpu.max"), &format!("{} {}", max, CPU_PERIOD_US));
        }
        if let Some(memory) = limits.memory_limit_mb {
            write_control(
                &group.join("memory.max"),
                &(memory * 1024 * 1024).to_string(),
            );
        }
        write_control(&group.join("cgroup.procs"), &pid.to_string());
    }

    fn apply_legacy(&self, pid: u32, limits: ProcessLimits) {
        let name = self.group_name(pid);

        if let Some(quota) = limits.cpu_quota {
            let group = self.root.join("cpu").join(&name);
            if let Err(e) = std::fs::create_dir_all(&group) {
                warn!("Failed to create cgroup directory: {}", e);
            } else {
                let quota_value = (quota as u64 * CPU_PERIOD_US) / 100;
                write_control(&group.join("cpu.cfs_period_us"), &CPU_PERIOD_US.to_string());
                write_control(&group.join("cpu.cfs_quota_us"), &quota_value.to_string());
                write_control(&group.join("cgroup.procs"), &pid.to_string());
            }
        }

        if let Some(memory) = limits.memory_limit_mb {
            let group = self.root.join("memory").join(&name);
            if let Err(e) = std::fs::create_dir_all(&group) {
                warn!("Failed to create cgroup directory: {}", e);
            } else {
                write_control(
                    &group.join("memory.limit_in_bytes"),
                    &(memory * 1024 * 1024).to_string(),
                );
                write_control(&group.join("cgroup.procs"), &pid.to_string());
            }
        }
    }

    /// Remove the cgroups created for a process
    pub fn cleanup(&self, pid: u32) {
        debug!("Cleaning up cgroups for PID {}", pid);
        let name = self.group_name(pid);
        for group in [
            self.root.join(&name),
            self.root.join("cpu").join(&name),
            self.root.join("memory").join(&name),
        ] {
            if group.exists() {
                // cgroup directories are removed with rmdir, never recursively
                if let Err(e) = std::fs::remove_dir(&group) {
                    debug!("Failed to remove cgroup {:?}: {}", group, e);
                }
            }
        }
    }
}

fn write_control(path: &std::path::Path, value: &str) {
    if let Err(e) = std::fs::write(path, value) {
        warn!("Failed to write {:?}: {}", path, e);
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unified_hierarchy_writes_limits() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("cgroup.controllers"), "cpu memory").unwrap();
        let limiter = CgroupLimiter::new(root.path(), "test");

        limiter.apply(
            42,
            ProcessLimits {
                cpu_quota: Some(50),
                memory_limit_mb: Some(256),
            },
        );

        let group = root.path().join("test-42");
        assert_eq!(std::fs::read_to_string(group.join("cpu.max")).unwrap(), "50000 100000");
        assert_eq!(
            std::fs::read_to_string(group.join("memory.max")).unwrap(),
            (256u64 * 1024 * 1024).to_string()
        );
        assert_eq!(std::fs::read_to_string(group.join("cgroup.procs")).unwrap(), "42");
    }

    #[test]
    fn test_legacy_hierarchy_writes_limits() {
        let root = TempDir::new().unwrap();
        let limiter = CgroupLimiter::new(root.path(), "test");

        limiter.apply(
            7,
            ProcessLimits {
                cpu_quota: Some(25),
                memory_limit_mb: None,
            },
        );

        let group = root.path().join("cpu/test-7");
        assert_eq!(
            std::fs::read_to_string(group.join("cpu.cfs_quota_us")).unwrap(),
            "25000"
        );
        assert!(!root.path().join("memory/test-7").exists());
    }
}
