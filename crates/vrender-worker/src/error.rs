//! Worker error types.

use thiserror::Error;
use vrender_gpu::GpuError;
use vrender_media::MediaError;
use vrender_models::{JobId, ProcessState, RenderStatus};

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Typed failure of a single render request.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("GPU telemetry unavailable: {0}")]
    TelemetryUnavailable(String),

    #[error("Invalid render request: {0}")]
    InvalidRequest(String),

    #[error("No GPU capacity for {requested_mb} MB: {reason}")]
    ResourcesUnavailable { requested_mb: u64, reason: String },

    #[error("Job {0} is already rendering on this worker")]
    AlreadyRunning(JobId),

    #[error("Render process {state}: {message}")]
    ProcessFailed {
        state: ProcessState,
        message: String,
        stderr_tail: Vec<String>,
        retryable: bool,
    },

    #[error("Render timed out after {elapsed_secs}s")]
    TimedOut {
        state: ProcessState,
        elapsed_secs: u64,
        stderr_tail: Vec<String>,
    },
}

impl RenderError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Stable machine-readable name, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::TelemetryUnavailable(_) => "telemetry_unavailable",
            RenderError::InvalidRequest(_) => "invalid_request",
            RenderError::ResourcesUnavailable { .. } => "resources_unavailable",
            RenderError::AlreadyRunning(_) => "already_running",
            RenderError::ProcessFailed { .. } => "process_failed",
            RenderError::TimedOut { .. } => "timed_out",
        }
    }

    /// Check if a later attempt (possibly on another worker) may succeed.
    ///
    /// A process failure is permanent when stderr matched a crash pattern.
    pub fn is_retryable(&self) -> bool {
        match self {
            RenderError::TelemetryUnavailable(_)
            | RenderError::ResourcesUnavailable { .. }
            | RenderError::TimedOut { .. } => true,
            RenderError::InvalidRequest(_) | RenderError::AlreadyRunning(_) => false,
            RenderError::ProcessFailed { retryable, .. } => *retryable,
        }
    }

    /// Terminal process state, when a process was started.
    pub fn state(&self) -> Option<ProcessState> {
        match self {
            RenderError::ProcessFailed { state, .. } | RenderError::TimedOut { state, .. } => {
                Some(*state)
            }
            _ => None,
        }
    }

    /// Last stderr lines of the render process, oldest first.
    pub fn stderr_tail(&self) -> &[String] {
        match self {
            RenderError::ProcessFailed { stderr_tail, .. }
            | RenderError::TimedOut { stderr_tail, .. } => stderr_tail,
            _ => &[],
        }
    }

    /// Status reported to the caller for this failure.
    pub fn render_status(&self) -> RenderStatus {
        match self {
            RenderError::TimedOut { .. } => RenderStatus::TimedOut,
            RenderError::ProcessFailed {
                state: ProcessState::Killed,
                ..
            } => RenderStatus::Killed,
            _ => RenderStatus::Failed,
        }
    }
}

impl From<GpuError> for RenderError {
    fn from(e: GpuError) -> Self {
        match e {
            GpuError::TelemetryUnavailable(msg) => RenderError::TelemetryUnavailable(msg),
            GpuError::AllocationTimedOut {
                requested_mb,
                waited_secs,
                ..
            } => RenderError::ResourcesUnavailable {
                requested_mb,
                reason: format!("still no capacity after waiting {}s", waited_secs),
            },
        }
    }
}

impl From<MediaError> for RenderError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::AlreadyRunning(job_id) => RenderError::AlreadyRunning(job_id),
            // The process claimed success but the artifact is unusable
            MediaError::OutputMissing(_) | MediaError::OutputEmpty(_) => {
                RenderError::ProcessFailed {
                    state: ProcessState::Completed,
                    message: e.to_string(),
                    stderr_tail: Vec::new(),
                    retryable: true,
                }
            }
            // The render command cannot be launched on this host
            MediaError::RenderCommandNotFound(_)
            | MediaError::SpawnFailed { .. }
            | MediaError::Io(_) => RenderError::ProcessFailed {
                state: ProcessState::Failed,
                message: e.to_string(),
                stderr_tail: Vec::new(),
                retryable: false,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Queue error: {0}")]
    Queue(#[from] vrender_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Render(e) => e.is_retryable(),
            WorkerError::Gpu(e) => e.is_retryable(),
            WorkerError::Queue(_) | WorkerError::Io(_) => true,
            WorkerError::JobFailed(_) | WorkerError::ConfigError(_) | WorkerError::Media(_) => {
                false
            }
        }
    }
}
