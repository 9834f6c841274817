pub mod http;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use url::Url;

use crate::errors::Result;

/// Opaque identity of one in-progress transfer inside the engine.
///
/// Ids are stable for the lifetime of the transfer, across subscriber
/// detach and re-attach; `live_transfers` relies on this to match
/// rediscovered transfers back to known records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(uuid::Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Continuation data for a transfer that was interrupted with partial
/// bytes on disk. Opaque to callers; round-trips through `to_bytes` /
/// `from_bytes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeData {
    pub url: Url,
    pub part_path: PathBuf,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    /// `ETag` or `Last-Modified` of the interrupted response, sent back
    /// as `If-Range` so a changed resource restarts from scratch.
    pub validator: Option<String>,
}

impl ResumeData {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One periodic progress report from the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransferUpdate {
    /// Bytes written since the previous report.
    pub bytes_written: u64,
    pub total_written: u64,
    /// 0 while the expected size is still unknown.
    pub total_expected: u64,
}

/// Events a transfer yields on its stream: any number of progress
/// reports followed by at most one terminal event.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress(TransferUpdate),
    /// The artifact landed at a transient spool location; the consumer
    /// owns moving it somewhere stable.
    Completed { artifact: PathBuf },
    Failed {
        reason: String,
        /// Present when partial bytes survived the interruption.
        resume_data: Option<ResumeData>,
    },
}

/// A started transfer: its stable id plus the stream of events it
/// will yield.
pub struct Transfer {
    pub id: TransferId,
    pub events: mpsc::Receiver<TransferEvent>,
}

/// A transfer the engine still tracks, reported from `live_transfers`.
///
/// `events` is `Some` when the transfer had lost its subscriber (the
/// owning process went dormant) and the engine handed back a fresh
/// stream, preloaded with a catch-up event.
pub struct LiveTransfer {
    pub id: TransferId,
    pub url: Url,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub events: Option<mpsc::Receiver<TransferEvent>>,
}

/// Façade over the transfer engine.
///
/// Implementations must keep transfers running while no subscriber is
/// attached and support rediscovery through `live_transfers`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start a fresh transfer from a URL.
    async fn begin(&self, url: Url) -> Result<Transfer>;

    /// Continue a transfer from resumable continuation data.
    async fn begin_resumed(&self, resume: ResumeData) -> Result<Transfer>;

    /// Suspend a transfer without discarding its state.
    async fn pause(&self, id: TransferId) -> Result<()>;

    /// Resume a suspended transfer.
    async fn resume(&self, id: TransferId) -> Result<()>;

    /// Best-effort cancel. The transfer may still deliver a late
    /// terminal event; consumers drop events for ids they no longer
    /// track.
    async fn cancel(&self, id: TransferId) -> Result<()>;

    /// Every transfer the engine still knows about. Safe to call
    /// repeatedly; re-subscribes any transfer whose event stream was
    /// lost.
    async fn live_transfers(&self) -> Vec<LiveTransfer>;
}
