use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("No resumable data available for {0}")]
    NoResumeData(String),

    #[error("Failed to relocate artifact to {path:?}: {source}")]
    ArtifactRelocation {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Pipeline rejected artifact: {0}")]
    Pipeline(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, DownloadError>;
