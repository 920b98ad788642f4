//! Error types for render process management.

use std::path::PathBuf;

use thiserror::Error;
use vrender_models::JobId;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while launching or checking a render process.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Render command not found: {0}")]
    RenderCommandNotFound(String),

    #[error("A process is already supervised for job {0}")]
    AlreadyRunning(JobId),

    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Output file not found: {0}")]
    OutputMissing(PathBuf),

    #[error("Output file is empty: {0}")]
    OutputEmpty(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    /// Create a spawn failure error.
    pub fn spawn_failed(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            program: program.into(),
            source,
        }
    }
}
