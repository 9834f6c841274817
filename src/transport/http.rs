use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::header::{ETAG, IF_RANGE, LAST_MODIFIED, RANGE};
use reqwest::{Client, ClientBuilder, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use url::Url;

use crate::config::ManagerConfig;
use crate::errors::{DownloadError, Result};
use crate::transport::{
    LiveTransfer, ResumeData, Transfer, TransferEvent, TransferId, TransferUpdate, Transport,
};
use crate::utils::ensure_dir_exists;

enum TransferCommand {
    Pause,
    Resume,
    Cancel,
}

struct EngineEntry {
    url: Url,
    command_tx: mpsc::UnboundedSender<TransferCommand>,
    /// Current event subscriber; replaced when a dormant owner
    /// re-attaches through `live_transfers`.
    subscriber: mpsc::Sender<TransferEvent>,
    bytes_downloaded: u64,
    total_bytes: u64,
    /// Terminal event that could not be delivered because the
    /// subscriber was gone; replayed on re-attach.
    finished: Option<TransferEvent>,
}

type Registry = Arc<Mutex<HashMap<TransferId, EngineEntry>>>;

/// HTTP transfer engine.
///
/// Each transfer streams into a part-file in the spool directory from its
/// own driver task, so transfers keep making progress while no manager is
/// attached to their event streams. Interruptions with partial bytes
/// produce [`ResumeData`]; resumption issues a ranged request validated
/// with `If-Range`.
pub struct HttpTransport {
    client: Client,
    spool_dir: PathBuf,
    event_capacity: usize,
    transfers: Registry,
}

impl HttpTransport {
    pub fn new(config: &ManagerConfig) -> Result<Self> {
        // No overall request timeout: artifact transfers are effectively
        // unbounded, only the connection attempt is capped.
        let client = ClientBuilder::new()
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .connect_timeout(config.connect_timeout())
            .user_agent(&config.user_agent)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            spool_dir: config.spool_dir.clone(),
            event_capacity: config.event_capacity.max(1),
            transfers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn start_transfer(
        &self,
        url: Url,
        part_path: Option<PathBuf>,
        resume_from: u64,
        total_hint: u64,
        validator: Option<String>,
    ) -> Result<Transfer> {
        ensure_dir_exists(&self.spool_dir).await?;

        let id = TransferId::new();
        let part_path = part_path.unwrap_or_else(|| self.spool_dir.join(format!("{}.part", id)));

        let (events_tx, events_rx) = mpsc::channel(self.event_capacity);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        {
            let mut transfers = self.transfers.lock().await;
            transfers.insert(
                id,
                EngineEntry {
                    url: url.clone(),
                    command_tx,
                    subscriber: events_tx,
                    bytes_downloaded: resume_from,
                    total_bytes: total_hint,
                    finished: None,
                },
            );
        }

        let client = self.client.clone();
        let transfers = self.transfers.clone();
        tokio::spawn(async move {
            run_transfer(
                client, transfers, id, url, part_path, resume_from, validator, command_rx,
            )
            .await;
        });

        Ok(Transfer {
            id,
            events: events_rx,
        })
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn begin(&self, url: Url) -> Result<Transfer> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DownloadError::TransferFailed(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }
        info!("Starting transfer: {}", url);
        self.start_transfer(url, None, 0, 0, None).await
    }

    async fn begin_resumed(&self, resume: ResumeData) -> Result<Transfer> {
        // The part file on disk is the source of truth for the offset;
        // a missing or truncated file degrades to a fresh transfer.
        let offset = tokio::fs::metadata(&resume.part_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        info!(
            "Resuming transfer: {} from {} of {} bytes",
            resume.url, offset, resume.total_bytes
        );

        let validator = if offset > 0 { resume.validator } else { None };
        self.start_transfer(
            resume.url,
            Some(resume.part_path),
            offset,
            resume.total_bytes,
            validator,
        )
        .await
    }

    async fn pause(&self, id: TransferId) -> Result<()> {
        let transfers = self.transfers.lock().await;
        let entry = transfers
            .get(&id)
            .ok_or_else(|| DownloadError::NotFound(format!("transfer {}", id)))?;
        // A closed command channel means the driver already finished.
        let _ = entry.command_tx.send(TransferCommand::Pause);
        Ok(())
    }

    async fn resume(&self, id: TransferId) -> Result<()> {
        let transfers = self.transfers.lock().await;
        let entry = transfers
            .get(&id)
            .ok_or_else(|| DownloadError::NotFound(format!("transfer {}", id)))?;
        let _ = entry.command_tx.send(TransferCommand::Resume);
        Ok(())
    }

    async fn cancel(&self, id: TransferId) -> Result<()> {
        let mut transfers = self.transfers.lock().await;
        let entry = transfers
            .get(&id)
            .ok_or_else(|| DownloadError::NotFound(format!("transfer {}", id)))?;
        if entry.command_tx.send(TransferCommand::Cancel).is_err() {
            // Driver already gone; drop whatever terminal state it left.
            transfers.remove(&id);
        }
        Ok(())
    }

    async fn live_transfers(&self) -> Vec<LiveTransfer> {
        let mut transfers = self.transfers.lock().await;
        let mut live = Vec::with_capacity(transfers.len());
        let mut handed_off = Vec::new();

        for (id, entry) in transfers.iter_mut() {
            if !entry.subscriber.is_closed() {
                // Still attached: the original stream keeps delivering.
                live.push(LiveTransfer {
                    id: *id,
                    url: entry.url.clone(),
                    bytes_downloaded: entry.bytes_downloaded,
                    total_bytes: entry.total_bytes,
                    events: None,
                });
                continue;
            }

            let (tx, rx) = mpsc::channel(self.event_capacity);
            if let Some(event) = entry.finished.take() {
                // Queued terminal event from the dormant period.
                let _ = tx.try_send(event);
                handed_off.push(*id);
            } else if entry.bytes_downloaded > 0 || entry.total_bytes > 0 {
                let _ = tx.try_send(TransferEvent::Progress(TransferUpdate {
                    bytes_written: 0,
                    total_written: entry.bytes_downloaded,
                    total_expected: entry.total_bytes,
                }));
            }
            entry.subscriber = tx;

            live.push(LiveTransfer {
                id: *id,
                url: entry.url.clone(),
                bytes_downloaded: entry.bytes_downloaded,
                total_bytes: entry.total_bytes,
                events: Some(rx),
            });
        }

        for id in handed_off {
            transfers.remove(&id);
        }

        live
    }
}

enum Outcome {
    Completed(PathBuf),
    Failed {
        reason: String,
        resume_data: Option<ResumeData>,
    },
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
async fn run_transfer(
    client: Client,
    transfers: Registry,
    id: TransferId,
    url: Url,
    part_path: PathBuf,
    resume_from: u64,
    validator: Option<String>,
    mut command_rx: mpsc::UnboundedReceiver<TransferCommand>,
) {
    let outcome = drive(
        &client,
        &transfers,
        id,
        &url,
        &part_path,
        resume_from,
        validator,
        &mut command_rx,
    )
    .await;

    match outcome {
        Outcome::Cancelled => {
            debug!("Transfer {} cancelled, discarding {:?}", id, part_path);
            let _ = tokio::fs::remove_file(&part_path).await;
            transfers.lock().await.remove(&id);
        }
        Outcome::Completed(artifact) => {
            info!("Transfer {} completed: {:?}", id, artifact);
            deliver_terminal(&transfers, id, TransferEvent::Completed { artifact }).await;
        }
        Outcome::Failed { reason, resume_data } => {
            warn!("Transfer {} failed: {}", id, reason);
            deliver_terminal(&transfers, id, TransferEvent::Failed { reason, resume_data }).await;
        }
    }
}

/// Hand the terminal event to the current subscriber, or stash it for
/// replay if the owner is dormant.
async fn deliver_terminal(transfers: &Registry, id: TransferId, event: TransferEvent) {
    let subscriber = {
        let transfers = transfers.lock().await;
        match transfers.get(&id) {
            Some(entry) => entry.subscriber.clone(),
            None => return, // cancelled underneath us
        }
    };

    if subscriber.send(event.clone()).await.is_ok() {
        transfers.lock().await.remove(&id);
    } else if let Some(entry) = transfers.lock().await.get_mut(&id) {
        entry.finished = Some(event);
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    client: &Client,
    transfers: &Registry,
    id: TransferId,
    url: &Url,
    part_path: &PathBuf,
    resume_from: u64,
    validator: Option<String>,
    command_rx: &mut mpsc::UnboundedReceiver<TransferCommand>,
) -> Outcome {
    let make_resume_data = |downloaded: u64, total: u64, validator: Option<String>| {
        if downloaded == 0 {
            return None;
        }
        Some(ResumeData {
            url: url.clone(),
            part_path: part_path.clone(),
            bytes_downloaded: downloaded,
            total_bytes: total,
            validator,
        })
    };

    let mut request = client.get(url.clone());
    if resume_from > 0 {
        request = request.header(RANGE, format!("bytes={}-", resume_from));
        if let Some(validator) = &validator {
            request = request.header(IF_RANGE, validator.clone());
        }
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            return Outcome::Failed {
                reason: e.to_string(),
                resume_data: make_resume_data(resume_from, 0, validator),
            }
        }
    };

    let status = response.status();
    if !status.is_success() {
        return Outcome::Failed {
            reason: format!("HTTP error: {}", status),
            resume_data: make_resume_data(resume_from, 0, validator),
        };
    }

    // Only a 206 continues the part file; a 200 answer to a ranged
    // request means the server restarted the entity from byte zero.
    let resumed = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
    let mut downloaded = if resumed { resume_from } else { 0 };
    let total_expected = response
        .content_length()
        .map(|len| downloaded + len)
        .unwrap_or(0);

    let response_validator = response
        .headers()
        .get(ETAG)
        .or_else(|| response.headers().get(LAST_MODIFIED))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let validator = if resumed { validator } else { response_validator };

    let open_result = if resumed {
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(part_path)
            .await
    } else {
        tokio::fs::File::create(part_path).await
    };
    let mut file = match open_result {
        Ok(file) => file,
        Err(e) => {
            return Outcome::Failed {
                reason: format!("failed to open part file {:?}: {}", part_path, e),
                resume_data: make_resume_data(resume_from, total_expected, validator),
            }
        }
    };

    {
        let mut transfers = transfers.lock().await;
        if let Some(entry) = transfers.get_mut(&id) {
            entry.bytes_downloaded = downloaded;
            entry.total_bytes = total_expected;
        }
    }

    let mut stream = response.bytes_stream();
    let mut paused = false;

    loop {
        if paused {
            // Suspended: stop polling the body until told otherwise.
            match command_rx.recv().await {
                Some(TransferCommand::Resume) => paused = false,
                Some(TransferCommand::Pause) => {}
                Some(TransferCommand::Cancel) | None => return Outcome::Cancelled,
            }
            continue;
        }

        tokio::select! {
            command = command_rx.recv() => match command {
                Some(TransferCommand::Pause) => paused = true,
                Some(TransferCommand::Resume) => {}
                Some(TransferCommand::Cancel) | None => return Outcome::Cancelled,
            },
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    if let Err(e) = file.write_all(&bytes).await {
                        return Outcome::Failed {
                            reason: format!("failed to write part file {:?}: {}", part_path, e),
                            resume_data: make_resume_data(downloaded, total_expected, validator),
                        };
                    }
                    downloaded += bytes.len() as u64;

                    let subscriber = {
                        let mut transfers = transfers.lock().await;
                        match transfers.get_mut(&id) {
                            Some(entry) => {
                                entry.bytes_downloaded = downloaded;
                                entry.total_bytes = total_expected;
                                Some(entry.subscriber.clone())
                            }
                            None => None,
                        }
                    };
                    if let Some(subscriber) = subscriber {
                        // Progress is lossy: a full or detached channel
                        // just drops the report.
                        let _ = subscriber.try_send(TransferEvent::Progress(TransferUpdate {
                            bytes_written: bytes.len() as u64,
                            total_written: downloaded,
                            total_expected,
                        }));
                    }
                }
                Some(Err(e)) => {
                    return Outcome::Failed {
                        reason: e.to_string(),
                        resume_data: make_resume_data(downloaded, total_expected, validator),
                    };
                }
                None => break,
            }
        }
    }

    if let Err(e) = file.flush().await {
        return Outcome::Failed {
            reason: format!("failed to flush part file {:?}: {}", part_path, e),
            resume_data: make_resume_data(downloaded, total_expected, validator),
        };
    }
    drop(file);

    let artifact = part_path.with_extension("artifact");
    if let Err(e) = tokio::fs::rename(part_path, &artifact).await {
        return Outcome::Failed {
            reason: format!("failed to finalize artifact {:?}: {}", artifact, e),
            resume_data: make_resume_data(downloaded, total_expected, validator),
        };
    }

    Outcome::Completed(artifact)
}
