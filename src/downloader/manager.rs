use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, Mutex};
use url::Url;

use crate::config::ManagerConfig;
use crate::downloader::{Download, DownloadEvent};
use crate::errors::{DownloadError, Result};
use crate::pipeline::ArtifactPipeline;
use crate::transport::{
    ResumeData, Transfer, TransferEvent, TransferId, TransferUpdate, Transport,
};

type BackgroundCallback = Box<dyn FnOnce() + Send>;

/// Messages consumed by the manager's serialized event loop. Transfer
/// events from every driver funnel through this one queue, so two
/// completions can never race on the collection.
enum LoopMessage {
    Transfer {
        transfer: TransferId,
        event: TransferEvent,
    },
    BackgroundEventsDelivered,
}

/// Orchestrator for the download collection.
///
/// Owns the canonical record state, maps transfer handles back to
/// records, reconciles against the engine's live transfer list after a
/// dormant period, and hands completed artifacts to the pipeline.
/// Constructed explicitly with its collaborators; hold it in an `Arc`
/// to share.
pub struct DownloadManager {
    downloads: Arc<Mutex<Vec<Download>>>,
    transport: Arc<dyn Transport>,
    events_tx: broadcast::Sender<DownloadEvent>,
    loop_tx: mpsc::UnboundedSender<LoopMessage>,
    background_done: Arc<Mutex<Option<BackgroundCallback>>>,
}

impl DownloadManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        pipeline: Arc<dyn ArtifactPipeline>,
        config: ManagerConfig,
    ) -> Self {
        let downloads: Arc<Mutex<Vec<Download>>> = Arc::new(Mutex::new(Vec::new()));
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let background_done: Arc<Mutex<Option<BackgroundCallback>>> = Arc::new(Mutex::new(None));

        let event_loop = EventLoop {
            downloads: downloads.clone(),
            pipeline,
            working_dir: config.working_dir.clone(),
            events_tx: events_tx.clone(),
            background_done: background_done.clone(),
        };
        tokio::spawn(event_loop.run(loop_rx));

        Self {
            downloads,
            transport,
            events_tx,
            loop_tx,
            background_done,
        }
    }

    /// Start downloading `url`. Idempotent by source URL: if a record
    /// for the same URL is already tracked it is resumed and returned
    /// instead of creating a duplicate.
    pub async fn start_download(&self, url: Url, id: Option<String>) -> Result<Download> {
        enum Reserved {
            Existing(Download),
            Fresh(Download),
        }

        let reserved = {
            let mut downloads = self.downloads.lock().await;
            if let Some(existing) = downloads
                .iter()
                .find(|d| d.source_url == url && !d.archive_only)
                .cloned()
            {
                Reserved::Existing(existing)
            } else {
                let download = Download::new(url.clone(), id, false);
                if downloads.iter().any(|d| d.id == download.id) {
                    return Err(DownloadError::Validation(format!(
                        "download id already in use: {}",
                        download.id
                    )));
                }
                downloads.push(download.clone());
                Reserved::Fresh(download)
            }
        };

        match reserved {
            Reserved::Existing(existing) => {
                info!(
                    "Download for {} already tracked as {}, resuming instead",
                    url, existing.id
                );
                self.resume_download(&existing.id).await?;
                Ok(self.get_download(&existing.id).await.unwrap_or(existing))
            }
            Reserved::Fresh(download) => match self.transport.begin(url).await {
                Ok(transfer) => {
                    let download = self
                        .attach_transfer(&download.id, transfer)
                        .await
                        .unwrap_or(download);
                    let _ = self.events_tx.send(DownloadEvent::Added(download.clone()));
                    Ok(download)
                }
                Err(e) => {
                    // Roll the reservation back; the caller retries.
                    let mut downloads = self.downloads.lock().await;
                    downloads.retain(|d| d.id != download.id);
                    Err(e)
                }
            },
        }
    }

    /// Track an archive-only unit: no network phase, progress driven by
    /// the caller through `update_unpack_progress`, removal is the
    /// caller's job as well.
    pub async fn start_archive(&self, url: Url, id: Option<String>) -> Result<Download> {
        let download = Download::new(url, id, true);
        {
            let mut downloads = self.downloads.lock().await;
            if downloads.iter().any(|d| d.id == download.id) {
                return Err(DownloadError::Validation(format!(
                    "download id already in use: {}",
                    download.id
                )));
            }
            downloads.push(download.clone());
        }
        let _ = self.events_tx.send(DownloadEvent::Added(download.clone()));
        Ok(download)
    }

    /// Resume a download: un-suspend a live transfer, continue from
    /// resume data, or re-issue the original request, in that order of
    /// preference. Archive-only units have nothing to resume from.
    pub async fn resume_download(&self, id: &str) -> Result<()> {
        let record = self
            .get_download(id)
            .await
            .ok_or_else(|| DownloadError::NotFound(format!("download {}", id)))?;

        if record.archive_only {
            return Err(DownloadError::NoResumeData(record.id));
        }
        if let Some(transfer) = record.transfer {
            return self.transport.resume(transfer).await;
        }

        let transfer = match record.resume_data.clone() {
            Some(resume) => self.transport.begin_resumed(resume).await?,
            None => self.transport.begin(record.source_url.clone()).await?,
        };
        self.attach_transfer(id, transfer).await;
        Ok(())
    }

    /// Cancel and remove a download. Removal is immediate and
    /// unconditional; the engine-side cancel is best-effort and a late
    /// terminal event for the old handle is ignored.
    pub async fn cancel_download(&self, id: &str) -> Result<()> {
        let removed = {
            let mut downloads = self.downloads.lock().await;
            downloads
                .iter()
                .position(|d| d.id == id)
                .map(|pos| downloads.remove(pos))
        };
        let record =
            removed.ok_or_else(|| DownloadError::NotFound(format!("download {}", id)))?;

        let _ = self.events_tx.send(DownloadEvent::Removed {
            id: record.id.clone(),
        });

        if let Some(transfer) = record.transfer {
            if let Err(e) = self.transport.cancel(transfer).await {
                warn!("Cancel of transfer {} did not reach the engine: {}", transfer, e);
            }
        }
        Ok(())
    }

    /// Drop a record from the collection without touching the engine.
    pub async fn remove_download(&self, id: &str) -> Result<()> {
        let removed = {
            let mut downloads = self.downloads.lock().await;
            downloads
                .iter()
                .position(|d| d.id == id)
                .map(|pos| downloads.remove(pos))
        };
        if let Some(record) = removed {
            let _ = self.events_tx.send(DownloadEvent::Removed { id: record.id });
        }
        Ok(())
    }

    pub async fn pause_download(&self, id: &str) -> Result<()> {
        let record = self
            .get_download(id)
            .await
            .ok_or_else(|| DownloadError::NotFound(format!("download {}", id)))?;
        match record.transfer {
            Some(transfer) => self.transport.pause(transfer).await,
            None => Ok(()),
        }
    }

    /// Suspend every active transfer. Records stay in the collection
    /// and resume data is untouched.
    pub async fn pause_all(&self) {
        for transfer in self.active_transfers().await {
            if let Err(e) = self.transport.pause(transfer).await {
                warn!("Pause of transfer {} failed: {}", transfer, e);
            }
        }
    }

    pub async fn resume_all(&self) {
        for transfer in self.active_transfers().await {
            if let Err(e) = self.transport.resume(transfer).await {
                warn!("Resume of transfer {} failed: {}", transfer, e);
            }
        }
    }

    /// Advance the unpack phase of a record. Clamped to [0, 1] and
    /// monotonic; a stale lower value never rewinds the stored one.
    pub async fn update_unpack_progress(&self, id: &str, progress: f64) -> Result<()> {
        let progress = progress.clamp(0.0, 1.0);
        let unpack_progress = {
            let mut downloads = self.downloads.lock().await;
            match downloads.iter_mut().find(|d| d.id == id) {
                Some(d) => {
                    if progress > d.unpack_progress {
                        d.unpack_progress = progress;
                    }
                    Some(d.unpack_progress)
                }
                None => None,
            }
        };
        match unpack_progress {
            Some(unpack_progress) => {
                let _ = self.events_tx.send(DownloadEvent::UnpackProgress {
                    id: id.to_string(),
                    unpack_progress,
                });
                Ok(())
            }
            None => Err(DownloadError::NotFound(format!("download {}", id))),
        }
    }

    pub async fn get_download(&self, id: &str) -> Option<Download> {
        let downloads = self.downloads.lock().await;
        downloads.iter().find(|d| d.id == id).cloned()
    }

    pub async fn get_by_transfer(&self, transfer: TransferId) -> Option<Download> {
        let downloads = self.downloads.lock().await;
        downloads.iter().find(|d| d.transfer == Some(transfer)).cloned()
    }

    /// Snapshot of the whole collection.
    pub async fn downloads(&self) -> Vec<Download> {
        let downloads = self.downloads.lock().await;
        downloads.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events_tx.subscribe()
    }

    /// Re-synchronize the collection with the engine's live transfer
    /// list after a dormant period. Known handles get their counters
    /// refreshed; unknown ones get a record synthesized from the
    /// transfer's original URL. Safe to call repeatedly: the handle
    /// lookup guarantees no duplicates.
    pub async fn reconcile(&self) -> Result<()> {
        let live = self.transport.live_transfers().await;
        info!("Reconciling against {} live transfers", live.len());

        for mut live_transfer in live {
            let events = live_transfer.events.take();

            let known = {
                let mut downloads = self.downloads.lock().await;
                match downloads
                    .iter_mut()
                    .find(|d| d.transfer == Some(live_transfer.id))
                {
                    Some(d) => {
                        if live_transfer.bytes_downloaded > d.bytes_downloaded {
                            d.bytes_downloaded = live_transfer.bytes_downloaded;
                        }
                        if live_transfer.total_bytes > 0 {
                            d.total_bytes = live_transfer.total_bytes;
                        }
                        if d.total_bytes > 0 {
                            let progress =
                                (d.bytes_downloaded as f64 / d.total_bytes as f64).min(1.0);
                            if progress > d.download_progress {
                                d.download_progress = progress;
                            }
                        }
                        true
                    }
                    None => false,
                }
            };

            if !known {
                let mut download = Download::new(live_transfer.url.clone(), None, false);
                download.transfer = Some(live_transfer.id);
                download.bytes_downloaded = live_transfer.bytes_downloaded;
                download.total_bytes = live_transfer.total_bytes;
                if live_transfer.total_bytes > 0 {
                    download.download_progress = (live_transfer.bytes_downloaded as f64
                        / live_transfer.total_bytes as f64)
                        .min(1.0);
                }
                download.started_at = Some(chrono::Utc::now());
                info!(
                    "Rediscovered transfer {} for {}, tracking as {}",
                    live_transfer.id, download.source_url, download.id
                );
                {
                    let mut downloads = self.downloads.lock().await;
                    downloads.push(download.clone());
                }
                let _ = self.events_tx.send(DownloadEvent::Added(download));
            }

            if let Some(events) = events {
                self.spawn_forwarder(Transfer {
                    id: live_transfer.id,
                    events,
                });
            }
        }

        // Everything the engine queued while we were dormant is now in
        // flight towards the loop; fire the one-shot behind it.
        let _ = self.loop_tx.send(LoopMessage::BackgroundEventsDelivered);
        Ok(())
    }

    /// Register the one-shot invoked after the engine's queued
    /// background events have all been delivered. Cleared on firing;
    /// it can never fire twice for one registration.
    pub async fn on_background_events_finished<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.background_done.lock().await = Some(Box::new(callback));
    }

    async fn active_transfers(&self) -> Vec<TransferId> {
        let downloads = self.downloads.lock().await;
        downloads.iter().filter_map(|d| d.transfer).collect()
    }

    /// Record the handle on the record and start forwarding its events
    /// into the serialized loop. Returns the updated snapshot, or `None`
    /// if the record was removed while the engine was starting up (the
    /// orphaned transfer gets cancelled).
    async fn attach_transfer(&self, id: &str, transfer: Transfer) -> Option<Download> {
        let snapshot = {
            let mut downloads = self.downloads.lock().await;
            match downloads.iter_mut().find(|d| d.id == id) {
                Some(d) => {
                    d.transfer = Some(transfer.id);
                    d.resume_data = None;
                    d.started_at = Some(chrono::Utc::now());
                    Some(d.clone())
                }
                None => None,
            }
        };

        match snapshot {
            Some(snapshot) => {
                self.spawn_forwarder(transfer);
                Some(snapshot)
            }
            None => {
                debug!("Record {} removed mid-start, cancelling transfer {}", id, transfer.id);
                let transfer_id = transfer.id;
                if let Err(e) = self.transport.cancel(transfer_id).await {
                    warn!("Cancel of orphaned transfer {} failed: {}", transfer_id, e);
                }
                None
            }
        }
    }

    fn spawn_forwarder(&self, transfer: Transfer) {
        let loop_tx = self.loop_tx.clone();
        tokio::spawn(async move {
            let Transfer { id, mut events } = transfer;
            while let Some(event) = events.recv().await {
                if loop_tx
                    .send(LoopMessage::Transfer {
                        transfer: id,
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
    }
}

/// The single serialized consumer of transfer events. All event-driven
/// mutation of the collection happens here, one message at a time.
struct EventLoop {
    downloads: Arc<Mutex<Vec<Download>>>,
    pipeline: Arc<dyn ArtifactPipeline>,
    working_dir: PathBuf,
    events_tx: broadcast::Sender<DownloadEvent>,
    background_done: Arc<Mutex<Option<BackgroundCallback>>>,
}

impl EventLoop {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<LoopMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                LoopMessage::Transfer { transfer, event } => match event {
                    TransferEvent::Progress(update) => self.apply_progress(transfer, update).await,
                    TransferEvent::Completed { artifact } => {
                        self.handle_completion(transfer, artifact).await
                    }
                    TransferEvent::Failed { reason, resume_data } => {
                        self.handle_failure(transfer, reason, resume_data).await
                    }
                },
                LoopMessage::BackgroundEventsDelivered => {
                    if let Some(callback) = self.background_done.lock().await.take() {
                        debug!("Background event backlog drained, notifying");
                        callback();
                    }
                }
            }
        }
    }

    async fn apply_progress(&self, transfer: TransferId, update: TransferUpdate) {
        let snapshot = {
            let mut downloads = self.downloads.lock().await;
            match downloads.iter_mut().find(|d| d.transfer == Some(transfer)) {
                Some(d) => {
                    if update.total_written > d.bytes_downloaded {
                        d.bytes_downloaded = update.total_written;
                    }
                    if update.total_expected > 0 {
                        d.total_bytes = update.total_expected;
                        let progress =
                            (update.total_written as f64 / update.total_expected as f64).min(1.0);
                        if progress > d.download_progress {
                            d.download_progress = progress;
                        }
                    }
                    Some((d.id.clone(), d.bytes_downloaded, d.total_bytes, d.download_progress))
                }
                None => None, // late event for a removed record
            }
        };

        if let Some((id, bytes_downloaded, total_bytes, download_progress)) = snapshot {
            let _ = self.events_tx.send(DownloadEvent::Progress {
                id,
                bytes_downloaded,
                total_bytes,
                download_progress,
            });
        }
    }

    async fn handle_completion(&self, transfer: TransferId, artifact: PathBuf) {
        let record = {
            let mut downloads = self.downloads.lock().await;
            match downloads.iter_mut().find(|d| d.transfer == Some(transfer)) {
                Some(d) => {
                    d.download_progress = 1.0;
                    if d.total_bytes > 0 {
                        d.bytes_downloaded = d.total_bytes;
                    }
                    Some(d.clone())
                }
                None => {
                    debug!("Ignoring completion for unknown transfer {}", transfer);
                    None
                }
            }
        };
        let Some(record) = record else { return };

        let destination = match self.relocate_artifact(&artifact, &record).await {
            Ok(destination) => destination,
            Err(e) => {
                // Local filesystem fault: keep the record so the stuck
                // state stays visible, and never run the pipeline on an
                // artifact that is not where it should be.
                error!("{}", e);
                return;
            }
        };

        let pipeline_error = match self.pipeline.handle_artifact(&destination, &record).await {
            Ok(()) => None,
            Err(e) => {
                warn!("Pipeline rejected {:?}: {}", destination, e);
                Some(e.to_string())
            }
        };

        {
            let mut downloads = self.downloads.lock().await;
            if let Some(pos) = downloads.iter().position(|d| d.id == record.id) {
                downloads.remove(pos);
            }
        }

        match pipeline_error {
            Some(reason) => {
                let _ = self.events_tx.send(DownloadEvent::PipelineFailed {
                    id: record.id.clone(),
                    reason,
                });
            }
            None => {
                info!("Download {} handed off: {:?}", record.id, destination);
                let _ = self.events_tx.send(DownloadEvent::Completed {
                    id: record.id.clone(),
                    artifact: destination,
                });
            }
        }
        let _ = self.events_tx.send(DownloadEvent::Removed { id: record.id });
    }

    /// Move the artifact from the spool to its stable per-download
    /// location. Last-writer-wins: an occupant at the destination is
    /// removed first.
    async fn relocate_artifact(&self, artifact: &Path, record: &Download) -> Result<PathBuf> {
        let dir = self.working_dir.join(&record.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| DownloadError::ArtifactRelocation {
                path: dir.clone(),
                source,
            })?;

        let destination = dir.join(&record.display_name);
        if destination.exists() {
            tokio::fs::remove_file(&destination).await.map_err(|source| {
                DownloadError::ArtifactRelocation {
                    path: destination.clone(),
                    source,
                }
            })?;
        }

        tokio::fs::rename(artifact, &destination).await.map_err(|source| {
            DownloadError::ArtifactRelocation {
                path: destination.clone(),
                source,
            }
        })?;
        Ok(destination)
    }

    async fn handle_failure(
        &self,
        transfer: TransferId,
        reason: String,
        resume_data: Option<ResumeData>,
    ) {
        let mut retained = None;
        let mut removed = None;
        {
            let mut downloads = self.downloads.lock().await;
            if let Some(pos) = downloads.iter().position(|d| d.transfer == Some(transfer)) {
                match resume_data {
                    // Interrupted with partial bytes: keep the record so
                    // the caller can resume from them.
                    Some(resume) => {
                        let d = &mut downloads[pos];
                        d.transfer = None;
                        d.resume_data = Some(resume);
                        retained = Some(d.id.clone());
                    }
                    None => {
                        removed = Some(downloads.remove(pos));
                    }
                }
            } else {
                debug!("Ignoring failure for unknown transfer {}", transfer);
            }
        }

        if let Some(id) = retained {
            warn!("Download {} interrupted, resumable: {}", id, reason);
            let _ = self.events_tx.send(DownloadEvent::Failed {
                id,
                reason,
                resumable: true,
            });
        } else if let Some(record) = removed {
            warn!("Download {} failed: {}", record.id, reason);
            let _ = self.events_tx.send(DownloadEvent::Failed {
                id: record.id.clone(),
                reason,
                resumable: false,
            });
            let _ = self.events_tx.send(DownloadEvent::Removed { id: record.id });
        }
    }
}
