//! Structured render job logging.
//!
//! Every lifecycle line of a render carries the same `job_id`/`user_id`
//! fields so a single job can be followed through admission, the render
//! process and its outcome.

use std::time::Duration;

use tracing::{debug, error, info, warn, Span};
use vrender_models::{Allocation, JobId, RenderJob};

use crate::error::RenderError;

/// Logger bound to one render job.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: JobId,
    user_id: String,
}

impl JobLogger {
    pub fn new(job_id: &JobId, user_id: &str) -> Self {
        Self {
            job_id: job_id.clone(),
            user_id: user_id.to_string(),
        }
    }

    pub fn for_job(job: &RenderJob) -> Self {
        Self::new(&job.job_id, &job.user_id)
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn received(&self, job: &RenderJob) {
        info!(
            job_id = %self.job_id,
            user_id = %self.user_id,
            memory_mb = job.memory_mb,
            frames = job.expected_frames(),
            "Render job received"
        );
    }

    pub fn admitted(&self, allocation: &Allocation, waited: Duration) {
        info!(
            job_id = %self.job_id,
            user_id = %self.user_id,
            device = allocation.device_index,
            reserved_mb = allocation.reserved_memory_mb,
            waited_ms = waited.as_millis() as u64,
            "Render job admitted"
        );
    }

    pub fn process_started(&self, pid: u32) {
        info!(job_id = %self.job_id, pid, "Render process started");
    }

    pub fn step(&self, name: &str) {
        debug!(job_id = %self.job_id, step = name, "Render step");
    }

    pub fn warning(&self, message: &str) {
        warn!(job_id = %self.job_id, user_id = %self.user_id, "{}", message);
    }

    pub fn completed(&self, output_bytes: u64, elapsed: Duration) {
        info!(
            job_id = %self.job_id,
            user_id = %self.user_id,
            output_bytes,
            elapsed_secs = elapsed.as_secs_f64(),
            "Render job completed"
        );
    }

    pub fn failed(&self, err: &RenderError) {
        let tail = err.stderr_tail().join(" | ");
        if err.is_retryable() {
            warn!(
                job_id = %self.job_id,
                user_id = %self.user_id,
                kind = err.kind(),
                stderr = %tail,
                "Render job failed (retryable): {}", err
            );
        } else {
            error!(
                job_id = %self.job_id,
                user_id = %self.user_id,
                kind = err.kind(),
                stderr = %tail,
                "Render job failed: {}", err
            );
        }
    }

    /// Span covering the whole render of this job.
    pub fn span(&self) -> Span {
        tracing::info_span!("render", job_id = %self.job_id, user_id = %self.user_id)
    }
}
