pub mod manager;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::transport::{ResumeData, TransferId};
use crate::utils::{display_name_for, generate_download_id};

/// Weight of the network phase in the overall progress of a two-phase
/// download; the unpack phase carries the remainder.
const DOWNLOAD_PHASE_WEIGHT: f64 = 0.7;

/// In-memory state for one tracked download.
///
/// Records live only in the manager's collection; durability of the
/// underlying transfer is the engine's job and is recovered through
/// reconciliation, never by persisting records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    pub id: String,
    pub source_url: Url,
    pub display_name: String,
    /// A unit with no network phase; progress is driven entirely by the
    /// unpack phase.
    pub archive_only: bool,
    pub download_progress: f64,
    pub bytes_downloaded: u64,
    /// 0 until the expected size is known.
    pub total_bytes: u64,
    pub unpack_progress: f64,
    /// The active transfer handle, at most one. Never present on
    /// archive-only records.
    pub transfer: Option<TransferId>,
    /// Continuation data left by an interrupted transfer.
    pub resume_data: Option<ResumeData>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Download {
    pub(crate) fn new(source_url: Url, id: Option<String>, archive_only: bool) -> Self {
        let display_name = display_name_for(&source_url);
        Self {
            id: id.unwrap_or_else(generate_download_id),
            source_url,
            display_name,
            archive_only,
            download_progress: 0.0,
            bytes_downloaded: 0,
            total_bytes: 0,
            unpack_progress: 0.0,
            transfer: None,
            resume_data: None,
            created_at: chrono::Utc::now(),
            started_at: None,
        }
    }

    /// Composite progress across both phases. Archive-only units are all
    /// unpack; everything else weights download against unpack 70/30.
    pub fn overall_progress(&self) -> f64 {
        if self.archive_only {
            self.unpack_progress
        } else {
            DOWNLOAD_PHASE_WEIGHT * self.download_progress
                + (1.0 - DOWNLOAD_PHASE_WEIGHT) * self.unpack_progress
        }
    }
}

/// Change events broadcast to observers. Every payload is an owned
/// snapshot; observers never see references into manager state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DownloadEvent {
    Added(Download),
    Progress {
        id: String,
        bytes_downloaded: u64,
        total_bytes: u64,
        download_progress: f64,
    },
    UnpackProgress {
        id: String,
        unpack_progress: f64,
    },
    Completed {
        id: String,
        artifact: PathBuf,
    },
    Failed {
        id: String,
        reason: String,
        /// Whether the record survived with resume data.
        resumable: bool,
    },
    /// Post-processing rejected the artifact; the fire-and-forget
    /// failure signal for the feedback layer.
    PipelineFailed {
        id: String,
        reason: String,
    },
    Removed {
        id: String,
    },
}
