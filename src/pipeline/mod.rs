use std::path::Path;

use log::info;

use crate::downloader::Download;
use crate::errors::Result;

/// Post-processing collaborator. Receives the relocated artifact after a
/// download completes; unpacking/installing is its business, reported
/// back through `update_unpack_progress` on the manager.
///
/// An error return means the artifact was rejected; the manager raises
/// the failure signal and ends the record's lifecycle either way.
#[async_trait::async_trait]
pub trait ArtifactPipeline: Send + Sync {
    async fn handle_artifact(&self, artifact: &Path, download: &Download) -> Result<()>;
}

/// Pipeline that only logs the hand-off. Useful for wiring and tests.
pub struct LoggingPipeline;

#[async_trait::async_trait]
impl ArtifactPipeline for LoggingPipeline {
    async fn handle_artifact(&self, artifact: &Path, download: &Download) -> Result<()> {
        info!(
            "Artifact for download {} ready at {:?}",
            download.id, artifact
        );
        Ok(())
    }
}
