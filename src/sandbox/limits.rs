//! Resource ceilings for sandboxed executions
//!
//! # CPU quota
//!
//! Both backends express CPU as a fraction of cores. cgroups v2 writes it to
//! `cpu.max` as `"{quota} {period}"`, Docker takes it as `NanoCpus`:
//!
//! ```text
//! cpu_cores = 0.5  →  cpu.max "50000 100000"   NanoCpus 500_000_000
//! cpu_cores = 2.0  →  cpu.max "200000 100000"  NanoCpus 2_000_000_000
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// cgroup CPU period in microseconds (100ms)
pub const CPU_PERIOD_MICROS: u64 = 100_000;

const MIB: u64 = 1024 * 1024;

/// Limits applied to every execution in a sandbox session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Number of CPU cores (fractional, e.g. 0.5 for half a core)
    pub cpu_cores: f64,

    /// Memory ceiling in bytes
    pub memory_bytes: u64,

    /// Maximum number of processes/threads
    pub pids_limit: u32,

    /// Wall-clock limit per execution
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Ceiling for each of stdout and stderr, in bytes
    pub output_limit_bytes: usize,

    /// Deny network access to executed code
    pub network_disabled: bool,
}

impl Default for ResourceLimits {
    /// Half a core, 128 MiB and no network
    fn default() -> Self {
        Self::small()
    }
}

impl ResourceLimits {
    /// Half a core, 128 MiB, 30s
    pub fn small() -> Self {
        Self {
            cpu_cores: 0.5,
            memory_bytes: 128 * MIB,
            pids_limit: 64,
            timeout: Duration::from_secs(30),
            output_limit_bytes: 64 * 1024,
            network_disabled: true,
        }
    }

    /// 1 core, 512 MiB, 60s
    pub fn medium() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_bytes: 512 * MIB,
            pids_limit: 128,
            timeout: Duration::from_secs(60),
            output_limit_bytes: 256 * 1024,
            network_disabled: true,
        }
    }

    /// 2 cores, 2 GiB, 120s
    pub fn large() -> Self {
        Self {
            cpu_cores: 2.0,
            memory_bytes: 2048 * MIB,
            pids_limit: 256,
            timeout: Duration::from_secs(120),
            output_limit_bytes: 1024 * 1024,
            network_disabled: true,
        }
    }

    /// Custom CPU and memory on top of the small preset
    pub fn custom(cpu_cores: f64, memory_mb: u64) -> Self {
        Self {
            cpu_cores,
            memory_bytes: memory_mb * MIB,
            ..Self::small()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network_disabled = !enabled;
        self
    }

    /// Microseconds of CPU per [`CPU_PERIOD_MICROS`]
    pub fn cpu_quota_micros(&self) -> u64 {
        (self.cpu_cores * CPU_PERIOD_MICROS as f64) as u64
    }

    /// CPU in units of 10^-9 cores, as Docker expects
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_cores * 1_000_000_000.0) as i64
    }

    /// RLIMIT_CPU seconds, one past the wall-clock timeout
    pub fn cpu_seconds(&self) -> u64 {
        self.timeout.as_secs() + 1
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if secs.is_finite() && secs >= 0.0 {
            Ok(Duration::from_secs_f64(secs))
        } else {
            Err(serde::de::Error::custom("timeout must be a non-negative number of seconds"))
        }
    }
}
