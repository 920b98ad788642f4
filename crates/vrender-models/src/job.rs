//! Render job definitions.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What to do when no GPU can take the job right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Fail immediately with a retryable error; the queue redelivers later.
    #[default]
    FailFast,
    /// Poll the ledger until capacity frees up or the timeout elapses.
    Wait { timeout_secs: u64 },
}

/// Output frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct Resolution {
    #[validate(range(min = 64, max = 4096))]
    pub width: u32,
    #[validate(range(min = 64, max = 4096))]
    pub height: u32,
}

impl Default for Resolution {
    /// 9:16 portrait, the short-form default.
    fn default() -> Self {
        Self {
            width: 576,
            height: 1024,
        }
    }
}

/// Generation quality knobs passed through to the render command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct RenderQuality {
    /// Diffusion sampling steps
    #[validate(range(min = 1, max = 200))]
    pub steps: u32,
    /// Classifier-free guidance scale
    #[validate(range(min = 0.0, max = 30.0))]
    pub guidance_scale: f32,
    /// Fixed seed for reproducible output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for RenderQuality {
    fn default() -> Self {
        Self {
            steps: 30,
            guidance_scale: 7.5,
            seed: None,
        }
    }
}

/// A request to generate one AI video clip on a GPU.
///
/// This is the payload the durable queue delivers to the worker.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct RenderJob {
    /// Unique job ID
    pub job_id: JobId,

    /// User ID
    pub user_id: String,

    /// Text prompt for the generator
    #[validate(length(min = 1, max = 4000))]
    pub prompt: String,

    /// Optional conditioning image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_image: Option<PathBuf>,

    /// Where the generator must write the clip
    pub output_path: PathBuf,

    /// Clip duration in seconds
    #[validate(range(min = 1, max = 120))]
    pub duration_secs: u32,

    /// Frames per second
    #[validate(range(min = 1, max = 60))]
    pub fps: u32,

    /// Output frame size
    #[serde(default)]
    #[validate(nested)]
    pub resolution: Resolution,

    /// Quality knobs
    #[serde(default)]
    #[validate(nested)]
    pub quality: RenderQuality,

    /// Declared GPU memory requirement in MB
    #[validate(range(min = 1))]
    pub memory_mb: u64,

    /// Scheduling priority recorded on the allocation (higher is more important)
    #[serde(default)]
    pub priority: i32,

    /// Behavior when no device has capacity
    #[serde(default)]
    pub admission: AdmissionPolicy,

    /// Per-job wall clock limit overriding the worker default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl RenderJob {
    /// Create a new render job with default quality settings.
    pub fn new(
        user_id: impl Into<String>,
        prompt: impl Into<String>,
        output_path: impl Into<PathBuf>,
        memory_mb: u64,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            user_id: user_id.into(),
            prompt: prompt.into(),
            input_image: None,
            output_path: output_path.into(),
            duration_secs: 5,
            fps: 24,
            resolution: Resolution::default(),
            quality: RenderQuality::default(),
            memory_mb,
            priority: 0,
            admission: AdmissionPolicy::default(),
            timeout_secs: None,
            created_at: Utc::now(),
        }
    }

    /// Set the conditioning image.
    pub fn with_input_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_image = Some(path.into());
        self
    }

    /// Set clip duration.
    pub fn with_duration(mut self, duration_secs: u32) -> Self {
        self.duration_secs = duration_secs;
        self
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set admission policy.
    pub fn with_admission(mut self, admission: AdmissionPolicy) -> Self {
        self.admission = admission;
        self
    }

    /// Set a per-job timeout.
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Total number of frames the generator is expected to produce.
    pub fn expected_frames(&self) -> u64 {
        self.duration_secs as u64 * self.fps as u64
    }

    /// Generate idempotency key for deduplication.
    pub fn idempotency_key(&self) -> String {
        format!("render:{}:{}", self.user_id, self.job_id)
    }
}
