//! Supervised process state, metrics and limits.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a supervised external process.
///
/// `Starting -> Running -> {Completed, Failed, TimedOut, Killed}`. A process that
/// times out passes through `TimedOut` and ends in `Killed` once the OS confirms death.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    #[default]
    Starting,
    Running,
    Completed,
    Failed,
    TimedOut,
    Killed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Completed => "completed",
            ProcessState::Failed => "failed",
            ProcessState::TimedOut => "timed_out",
            ProcessState::Killed => "killed",
        }
    }

    /// Whether the process has exited (or been given up on).
    ///
    /// `TimedOut` is not terminal: termination is still in progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Failed | ProcessState::Killed
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cumulative metrics for one supervised process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub peak_memory_mb: u64,
    /// Rolling average over all resource samples taken so far
    pub avg_cpu_percent: f32,
    pub frames_processed: u64,
    /// Stderr lines that matched an error pattern
    pub error_count: u32,
    #[serde(skip)]
    samples: u32,
}

impl ProcessMetrics {
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(now),
            ..Default::default()
        }
    }

    /// Fold a new resource sample into the peak and rolling average.
    pub fn record_sample(&mut self, cpu_percent: f32, memory_mb: u64) {
        self.peak_memory_mb = self.peak_memory_mb.max(memory_mb);
        self.samples += 1;
        let n = self.samples as f32;
        self.avg_cpu_percent += (cpu_percent - self.avg_cpu_percent) / n;
    }

    pub fn sample_count(&self) -> u32 {
        self.samples
    }

    /// Wall time between start and end (or now, if still running).
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - start).to_std().ok()
    }
}

/// Point-in-time resource usage of a supervised process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResourceInfo {
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_mb: u64,
    pub uptime_secs: u64,
    /// Reported by the GPU driver per pid; advisory only.
    pub gpu_memory_mb: Option<u64>,
}

/// Per-process limits checked on every poll tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessLimits {
    pub max_memory_mb: u64,
    pub max_cpu_percent: f32,
    pub max_gpu_memory_mb: u64,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 32 * 1024,
            max_cpu_percent: 800.0,
            max_gpu_memory_mb: 22 * 1024,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
