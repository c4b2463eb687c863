//! cgroup v2 limits for process sandboxes
//!
//! Each session gets its own cgroup under /sys/fs/cgroup/sandagent/{name}/
//!
//! ```text
//! /sys/fs/cgroup/                     ← cgroup v2 root
//! └── sandagent/                      ← our namespace
//!     ├── sandagent-<session>/        ← per-session cgroup
//!     │   ├── cpu.max                 ← "50000 100000" = half a core
//!     │   ├── memory.max              ← bytes
//!     │   ├── pids.max                ← process/thread ceiling
//!     │   └── cgroup.procs            ← PIDs in this cgroup
//!     └── ...
//! ```
//!
//! Children inherit the cgroup of the process that spawned them, so adding
//! the top-level interpreter puts everything it forks under the limits.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::limits::{ResourceLimits, CPU_PERIOD_MICROS};

/// Base path for cgroup v2 filesystem
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Our namespace within the cgroup hierarchy
const CGROUP_NAMESPACE: &str = "sandagent";

/// Manages per-session cgroups
#[derive(Debug, Clone)]
pub struct CgroupManager {
    /// Base path: /sys/fs/cgroup/sandagent
    base_path: PathBuf,
}

impl CgroupManager {
    /// Open the sandagent namespace, creating it if needed
    ///
    /// Enables the cpu, memory and pids controllers for child cgroups.
    /// Requires root or a delegated cgroup subtree.
    pub fn new() -> io::Result<Self> {
        Self::with_base_path(PathBuf::from(CGROUP_ROOT).join(CGROUP_NAMESPACE))
    }

    /// Use `base_path` as the namespace directory
    pub fn with_base_path(base_path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = base_path.into();
        if !base_path.exists() {
            fs::create_dir_all(&base_path)?;
        }
        // Children can only use controllers enabled in the parent's subtree_control
        fs::write(base_path.join("cgroup.subtree_control"), "+cpu +memory +pids")?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn group_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    /// Create a cgroup with limits applied
    pub fn create(&self, name: &str, limits: &ResourceLimits) -> io::Result<()> {
        let path = self.group_path(name);
        fs::create_dir_all(&path)?;

        let cpu_max = format!("{} {}", limits.cpu_quota_micros(), CPU_PERIOD_MICROS);
        fs::write(path.join("cpu.max"), cpu_max)?;
        fs::write(path.join("memory.max"), limits.memory_bytes.to_string())?;
        fs::write(path.join("pids.max"), limits.pids_limit.to_string())?;
        Ok(())
    }

    /// Membership file a process writes itself into
    pub fn procs_path(&self, name: &str) -> PathBuf {
        self.group_path(name).join("cgroup.procs")
    }

    /// Kill every process in the cgroup (kernel 5.14+)
    pub fn kill_all(&self, name: &str) -> io::Result<()> {
        let kill = self.group_path(name).join("cgroup.kill");
        if kill.exists() {
            fs::write(kill, "1")?;
        }
        Ok(())
    }

    /// Remove the cgroup; it must have no live processes
    pub fn destroy(&self, name: &str) -> io::Result<()> {
        let path = self.group_path(name);
        if path.exists() {
            // rmdir, not rm -rf: the kernel owns the control files
            fs::remove_dir(&path)?;
        }
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.group_path(name).exists()
    }
}
