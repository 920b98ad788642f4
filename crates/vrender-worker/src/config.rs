//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use vrender_gpu::DEFAULT_POLL_INTERVAL;
use vrender_models::ResourceLimits;

use crate::coordinator::CoordinatorConfig;
use crate::retry::RetryConfig;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent render jobs on this host
    pub max_concurrent_jobs: usize,
    /// How long shutdown waits for in-flight renders before killing them
    pub shutdown_timeout: Duration,
    /// Working directory of render processes; relative output paths resolve here
    pub work_dir: PathBuf,
    /// Executable of the AI video generator
    pub render_command: String,
    /// Arguments placed before the generated flags (e.g. `-m vgen.render`)
    pub render_args: Vec<String>,
    /// Upper bound on how long a job may wait for GPU capacity
    pub max_allocation_wait: Duration,
    /// Interval between admission attempts while waiting
    pub allocation_poll_interval: Duration,
    /// How often to look for pending jobs abandoned by crashed workers
    pub claim_interval: Duration,
    /// How often to sweep allocations whose job is gone
    pub stale_sweep_interval: Duration,
    /// Minimum allocation age before the sweep may release it
    pub stale_max_age: Duration,
    /// GPU admission limits
    pub gpu_limits: ResourceLimits,
    /// Port of the Prometheus listener, if any
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            shutdown_timeout: Duration::from_secs(60),
            work_dir: PathBuf::from("/tmp/vrender"),
            render_command: "vgen-render".to_string(),
            render_args: Vec::new(),
            max_allocation_wait: Duration::from_secs(600),
            allocation_poll_interval: DEFAULT_POLL_INTERVAL,
            claim_interval: Duration::from_secs(30),
            stale_sweep_interval: Duration::from_secs(60),
            stale_max_age: Duration::from_secs(300),
            gpu_limits: ResourceLimits::default(),
            metrics_port: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_concurrent_jobs: std::env::var("WORKER_MAX_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_jobs),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            render_command: std::env::var("RENDER_COMMAND").unwrap_or(defaults.render_command),
            render_args: std::env::var("RENDER_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            max_allocation_wait: Duration::from_secs(
                std::env::var("WORKER_ALLOCATION_WAIT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
            allocation_poll_interval: defaults.allocation_poll_interval,
            claim_interval: Duration::from_secs(
                std::env::var("WORKER_CLAIM_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(30),
            ),
            stale_sweep_interval: Duration::from_secs(
                std::env::var("WORKER_STALE_SWEEP_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(60),
            ),
            stale_max_age: Duration::from_secs(
                std::env::var("WORKER_STALE_MAX_AGE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            gpu_limits: gpu_limits_from_env(),
            metrics_port: std::env::var("METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }

    /// Settings for the render coordinator.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            render_command: self.render_command.clone(),
            render_args: self.render_args.clone(),
            work_dir: Some(self.work_dir.clone()),
            max_allocation_wait: self.max_allocation_wait,
            allocation_poll_interval: self.allocation_poll_interval,
            telemetry_retry: RetryConfig::new("gpu_admission"),
        }
    }
}

/// Read GPU admission limits from `GPU_*` variables.
pub fn gpu_limits_from_env() -> ResourceLimits {
    let defaults = ResourceLimits::default();

    ResourceLimits {
        max_reservable_memory_mb: std::env::var("GPU_MAX_RESERVABLE_MB")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_reservable_memory_mb),
        max_utilization_percent: std::env::var("GPU_MAX_UTILIZATION")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_utilization_percent),
        max_temperature_c: std::env::var("GPU_MAX_TEMPERATURE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_temperature_c),
        reserved_headroom_mb: std::env::var("GPU_HEADROOM_MB")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.reserved_headroom_mb),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.allocation_poll_interval, Duration::from_secs(5));
        assert!(config.metrics_port.is_none());

        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.render_command, "vgen-render");
        assert_eq!(coordinator.work_dir, Some(PathBuf::from("/tmp/vrender")));
    }

    #[test]
    fn test_zero_intervals_fall_back_to_defaults() {
        std::env::set_var("WORKER_CLAIM_INTERVAL_SECS", "0");
        std::env::set_var("WORKER_STALE_SWEEP_SECS", "0");
        let config = WorkerConfig::from_env();
        std::env::remove_var("WORKER_CLAIM_INTERVAL_SECS");
        std::env::remove_var("WORKER_STALE_SWEEP_SECS");

        assert_eq!(config.claim_interval, Duration::from_secs(30));
        assert_eq!(config.stale_sweep_interval, Duration::from_secs(60));
    }
}
