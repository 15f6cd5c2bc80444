//! Persistent storage
//!
//! Data directory, persisted server settings and GGUF model files fetched from
//! the HuggingFace Hub.

pub mod huggingface;
pub mod settings;

use directories::ProjectDirs;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the storage layer
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Could not determine data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Root directory for settings and downloaded models.
///
/// `LOCALLAB_DATA_DIR` overrides the platform default.
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    if let Ok(dir) = std::env::var("LOCALLAB_DATA_DIR") {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    ProjectDirs::from("dev", "locallab", "locallab")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
