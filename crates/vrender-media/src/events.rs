//! Notifications delivered to process subscribers.

use serde::Serialize;
use vrender_models::{JobId, ProcessMetrics, ProcessState};

/// Why the supervisor ended a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Wall-clock limit exceeded
    Timeout,
    /// Explicit `terminate` call
    Cancelled,
    /// Stderr matched a crash pattern
    FatalError,
}

/// Which per-process limit was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitViolation {
    Memory,
    Cpu,
    GpuMemory,
}

/// Final result of a supervised process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessOutcome {
    pub job_id: JobId,
    /// One of `Completed`, `Failed` or `Killed`
    pub state: ProcessState,
    pub exit_code: Option<i32>,
    /// Set when the supervisor ended the process itself
    pub stop_reason: Option<StopReason>,
    /// First stderr line that matched a fatal pattern
    pub fatal_error: Option<String>,
    /// Last stderr lines, oldest first
    pub stderr_tail: Vec<String>,
    pub metrics: ProcessMetrics,
    /// The process did not die after SIGKILL and tracking was dropped anyway
    pub cleanup_forced: bool,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        self.state == ProcessState::Completed
    }

    /// Stderr tail joined into one block for error messages.
    pub fn stderr_text(&self) -> String {
        self.stderr_tail.join("\n")
    }
}

/// A notification about one supervised process.
///
/// Events from stdout arrive in the order the lines were written. `Exited` is
/// always the last event on a subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    Started {
        pid: u32,
    },
    Progress {
        percent: u8,
    },
    Frames {
        count: u64,
    },
    Step {
        name: String,
    },
    /// Stderr reported a transient failure; the process keeps running
    RecoverableError {
        line: String,
    },
    /// Stderr reported a crash; the process is being killed
    FatalError {
        line: String,
    },
    /// A per-process limit was exceeded; the caller decides what to do
    LimitExceeded {
        kind: LimitViolation,
        value: f64,
        limit: f64,
    },
    TimedOut,
    /// SIGKILL did not take effect within the grace period
    CleanupForced,
    Exited(ProcessOutcome),
}
