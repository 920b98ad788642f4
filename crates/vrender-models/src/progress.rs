//! Render progress messages delivered to callers.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Caller-visible render status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    /// Waiting for GPU capacity
    #[default]
    Allocating,
    /// External render process is running
    Running,
    /// Output artifact produced and verified
    Completed,
    /// Render failed
    Failed,
    /// Wall-clock limit exceeded
    TimedOut,
    /// Cancelled or force-terminated
    Killed,
}

impl RenderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderStatus::Allocating => "allocating",
            RenderStatus::Running => "running",
            RenderStatus::Completed => "completed",
            RenderStatus::Failed => "failed",
            RenderStatus::TimedOut => "timed_out",
            RenderStatus::Killed => "killed",
        }
    }

    /// Check if this is a terminal state (no more updates expected).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RenderStatus::Allocating | RenderStatus::Running)
    }
}

impl std::fmt::Display for RenderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One progress notification for a render job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RenderProgress {
    pub job_id: JobId,
    pub status: RenderStatus,
    /// Progress percentage (0-100)
    pub progress_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub frames_generated: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RenderProgress {
    pub fn new(job_id: JobId, status: RenderStatus) -> Self {
        Self {
            job_id,
            status,
            progress_percent: 0,
            current_step: None,
            frames_generated: 0,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_percent(mut self, percent: u8) -> Self {
        self.progress_percent = percent.min(100);
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn with_frames(mut self, frames: u64) -> Self {
        self.frames_generated = frames;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_status() {
        assert!(!RenderStatus::Running.is_terminal());
        assert!(RenderStatus::TimedOut.is_terminal());
        assert_eq!(RenderStatus::TimedOut.to_string(), "timed_out");
    }

    #[test]
    fn test_progress_percent_clamped() {
        let p = RenderProgress::new(JobId::from("j"), RenderStatus::Running).with_percent(250);
        assert_eq!(p.progress_percent, 100);
    }

    #[test]
    fn test_progress_json_omits_empty_fields() {
        let p = RenderProgress::new(JobId::from("j"), RenderStatus::Running).with_frames(12);
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["frames_generated"], 12);
        assert!(json.get("error").is_none());
    }
}
