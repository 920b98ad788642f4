//! Process supervisor configuration.

use std::time::Duration;

use vrender_models::ProcessLimits;

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval of the shared resource poll
    pub poll_interval: Duration,
    /// Wait between SIGINT and SIGKILL, and again before giving up on a process
    pub grace_period: Duration,
    /// Default per-process limits
    pub limits: ProcessLimits,
    /// Stderr lines kept per process for failure reports
    pub stderr_tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            grace_period: Duration::from_secs(10),
            limits: ProcessLimits::default(),
            stderr_tail_lines: 20,
        }
    }
}

impl SupervisorConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let default_limits = defaults.limits.clone();

        Self {
            poll_interval: Duration::from_secs(env_parse_nonzero("SUPERVISOR_POLL_SECS", 2)),
            grace_period: Duration::from_secs(env_parse("SUPERVISOR_GRACE_SECS", 10)),
            limits: ProcessLimits {
                max_memory_mb: env_parse("PROCESS_MAX_MEMORY_MB", default_limits.max_memory_mb),
                max_cpu_percent: env_parse(
                    "PROCESS_MAX_CPU_PERCENT",
                    default_limits.max_cpu_percent,
                ),
                max_gpu_memory_mb: env_parse(
                    "PROCESS_MAX_GPU_MEMORY_MB",
                    default_limits.max_gpu_memory_mb,
                ),
                timeout: Duration::from_secs(env_parse(
                    "PROCESS_TIMEOUT_SECS",
                    default_limits.timeout.as_secs(),
                )),
            },
            stderr_tail_lines: defaults.stderr_tail_lines,
        }
    }
}

fn env_parse_nonzero(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|n| *n > 0)
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
