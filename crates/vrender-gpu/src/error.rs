//! Error types for GPU telemetry and admission.

use thiserror::Error;
use vrender_models::JobId;

/// Result type for GPU operations.
pub type GpuResult<T> = Result<T, GpuError>;

/// Errors that can occur while reading telemetry or allocating GPU memory.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("GPU telemetry unavailable: {0}")]
    TelemetryUnavailable(String),

    #[error("Timed out after {waited_secs}s waiting for {requested_mb} MB of GPU memory for job {job_id}")]
    AllocationTimedOut {
        job_id: JobId,
        requested_mb: u64,
        waited_secs: u64,
    },
}

impl GpuError {
    /// Create a telemetry failure error.
    pub fn telemetry_unavailable(message: impl Into<String>) -> Self {
        Self::TelemetryUnavailable(message.into())
    }

    /// Both telemetry hiccups and admission timeouts clear up on their own.
    pub fn is_retryable(&self) -> bool {
        true
    }
}
