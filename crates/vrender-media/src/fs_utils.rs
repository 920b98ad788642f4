//! Output artifact checks.

use std::path::Path;

use crate::error::{MediaError, MediaResult};

/// Check that the render produced a non-empty regular file. Returns its size in bytes.
pub async fn verify_output(path: impl AsRef<Path>) -> MediaResult<u64> {
    let path = path.as_ref();

    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(MediaError::OutputMissing(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    if !metadata.is_file() {
        return Err(MediaError::OutputMissing(path.to_path_buf()));
    }
    if metadata.len() == 0 {
        return Err(MediaError::OutputEmpty(path.to_path_buf()));
    }

    Ok(metadata.len())
}
