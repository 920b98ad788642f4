//! Job envelope for queue storage.

use serde::{Deserialize, Serialize};
use vrender_models::{JobId, RenderJob};

/// Generic job wrapper for queue storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueJob {
    /// Generate one AI video clip on a GPU
    Render(RenderJob),
}

impl QueueJob {
    pub fn job_id(&self) -> &JobId {
        match self {
            QueueJob::Render(j) => &j.job_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            QueueJob::Render(j) => &j.user_id,
        }
    }

    pub fn idempotency_key(&self) -> String {
        match self {
            QueueJob::Render(j) => j.idempotency_key(),
        }
    }
}

impl From<RenderJob> for QueueJob {
    fn from(job: RenderJob) -> Self {
        QueueJob::Render(job)
    }
}
