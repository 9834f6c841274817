use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use url::Url;

use packfetch::{
    ArtifactPipeline, Download, DownloadError, DownloadEvent, DownloadManager, LiveTransfer,
    ManagerConfig, ResumeData, Transfer, TransferEvent, TransferId, TransferUpdate, Transport,
};

/// Polls an async condition until it holds or the deadline passes.
macro_rules! wait_until {
    ($cond:expr, $msg:expr) => {{
        let mut satisfied = false;
        for _ in 0..400 {
            if $cond {
                satisfied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(satisfied, $msg);
    }};
}

struct MockTransfer {
    url: Url,
    sender: mpsc::Sender<TransferEvent>,
    attached: bool,
    bytes: u64,
    total: u64,
}

#[derive(Default)]
struct MockState {
    transfers: HashMap<TransferId, MockTransfer>,
    begun: Vec<Url>,
    resumed_blobs: Vec<ResumeData>,
    unsuspended: Vec<TransferId>,
    paused: Vec<TransferId>,
    cancelled: Vec<TransferId>,
}

#[derive(Default)]
struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    async fn open(&self, url: Url, attached: bool, bytes: u64, total: u64) -> Transfer {
        let (sender, events) = mpsc::channel(32);
        let id = TransferId::new();
        let mut state = self.state.lock().await;
        state.transfers.insert(
            id,
            MockTransfer {
                url,
                sender,
                attached,
                bytes,
                total,
            },
        );
        Transfer { id, events }
    }

    /// Seed a transfer the engine kept alive while no manager was
    /// attached (its original event stream is gone).
    async fn seed_live(&self, url: Url, bytes: u64, total: u64) -> TransferId {
        let transfer = self.open(url, false, bytes, total).await;
        transfer.id
    }

    async fn emit(&self, id: TransferId, event: TransferEvent) {
        let sender = {
            let state = self.state.lock().await;
            state.transfers[&id].sender.clone()
        };
        sender.send(event).await.expect("event stream closed");
    }

    async fn begin_count(&self) -> usize {
        self.state.lock().await.begun.len()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn begin(&self, url: Url) -> packfetch::Result<Transfer> {
        let transfer = self.open(url.clone(), true, 0, 0).await;
        self.state.lock().await.begun.push(url);
        Ok(transfer)
    }

    async fn begin_resumed(&self, resume: ResumeData) -> packfetch::Result<Transfer> {
        let transfer = self
            .open(resume.url.clone(), true, resume.bytes_downloaded, resume.total_bytes)
            .await;
        self.state.lock().await.resumed_blobs.push(resume);
        Ok(transfer)
    }

    async fn pause(&self, id: TransferId) -> packfetch::Result<()> {
        self.state.lock().await.paused.push(id);
        Ok(())
    }

    async fn resume(&self, id: TransferId) -> packfetch::Result<()> {
        self.state.lock().await.unsuspended.push(id);
        Ok(())
    }

    async fn cancel(&self, id: TransferId) -> packfetch::Result<()> {
        self.state.lock().await.cancelled.push(id);
        Ok(())
    }

    async fn live_transfers(&self) -> Vec<LiveTransfer> {
        let mut state = self.state.lock().await;
        state
            .transfers
            .iter_mut()
            .map(|(id, transfer)| {
                let events = if transfer.attached {
                    None
                } else {
                    let (sender, events) = mpsc::channel(32);
                    transfer.sender = sender;
                    transfer.attached = true;
                    Some(events)
                };
                LiveTransfer {
                    id: *id,
                    url: transfer.url.clone(),
                    bytes_downloaded: transfer.bytes,
                    total_bytes: transfer.total,
                    events,
                }
            })
            .collect()
    }
}

#[derive(Default)]
struct MockPipeline {
    calls: StdMutex<Vec<PathBuf>>,
    fail: bool,
}

impl MockPipeline {
    fn rejecting() -> Self {
        Self {
            calls: StdMutex::new(Vec::new()),
            fail: true,
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ArtifactPipeline for MockPipeline {
    async fn handle_artifact(&self, artifact: &Path, _download: &Download) -> packfetch::Result<()> {
        self.calls.lock().unwrap().push(artifact.to_path_buf());
        if self.fail {
            Err(DownloadError::Pipeline("rejected by test pipeline".to_string()))
        } else {
            Ok(())
        }
    }
}

struct Harness {
    manager: DownloadManager,
    transport: Arc<MockTransport>,
    pipeline: Arc<MockPipeline>,
    working_dir: PathBuf,
    scratch: tempfile::TempDir,
}

fn harness_with(pipeline: MockPipeline) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let scratch = tempfile::tempdir().expect("tempdir");
    let config = ManagerConfig {
        spool_dir: scratch.path().join("spool"),
        working_dir: scratch.path().join("artifacts"),
        ..ManagerConfig::default()
    };
    let transport = Arc::new(MockTransport::default());
    let pipeline = Arc::new(pipeline);
    let manager = DownloadManager::new(transport.clone(), pipeline.clone(), config.clone());
    Harness {
        manager,
        transport,
        pipeline,
        working_dir: config.working_dir,
        scratch,
    }
}

fn harness() -> Harness {
    harness_with(MockPipeline::default())
}

fn url(s: &str) -> Url {
    Url::parse(s).expect("test url")
}

/// Blocks until the observer stream yields an event matching `pred`.
async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<DownloadEvent>,
    mut pred: F,
) -> DownloadEvent
where
    F: FnMut(&DownloadEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn spool_artifact(h: &Harness, name: &str, contents: &[u8]) -> PathBuf {
    let dir = h.scratch.path().join("spool");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let path = dir.join(name);
    tokio::fs::write(&path, contents).await.unwrap();
    path
}

#[tokio::test]
async fn starting_same_url_twice_reuses_the_record() {
    let h = harness();
    let source = url("https://example.test/app.ipa");

    let first = h.manager.start_download(source.clone(), None).await.unwrap();
    let second = h.manager.start_download(source, None).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(h.manager.downloads().await.len(), 1);
    assert_eq!(h.transport.begin_count().await, 1);
    // The second call resumed the existing transfer instead.
    let state = h.transport.state.lock().await;
    assert_eq!(state.unsuspended, vec![first.transfer.unwrap()]);
}

#[tokio::test]
async fn progress_events_drive_the_record_counters() {
    let h = harness();
    let download = h
        .manager
        .start_download(url("https://example.test/app.ipa"), None)
        .await
        .unwrap();
    let transfer = download.transfer.unwrap();

    h.transport
        .emit(
            transfer,
            TransferEvent::Progress(TransferUpdate {
                bytes_written: 500,
                total_written: 1000,
                total_expected: 2000,
            }),
        )
        .await;
    wait_until!(
        {
            let d = h.manager.get_download(&download.id).await.unwrap();
            d.bytes_downloaded == 1000 && d.download_progress == 0.5
        },
        "first progress event not applied"
    );

    h.transport
        .emit(
            transfer,
            TransferEvent::Progress(TransferUpdate {
                bytes_written: 1000,
                total_written: 2000,
                total_expected: 2000,
            }),
        )
        .await;
    wait_until!(
        {
            let d = h.manager.get_download(&download.id).await.unwrap();
            d.bytes_downloaded == 2000 && d.download_progress == 1.0
        },
        "second progress event not applied"
    );
}

#[tokio::test]
async fn stale_progress_never_rewinds_counters() {
    let h = harness();
    let download = h
        .manager
        .start_download(url("https://example.test/app.ipa"), None)
        .await
        .unwrap();
    let transfer = download.transfer.unwrap();

    h.transport
        .emit(
            transfer,
            TransferEvent::Progress(TransferUpdate {
                bytes_written: 1500,
                total_written: 1500,
                total_expected: 2000,
            }),
        )
        .await;
    wait_until!(
        h.manager.get_download(&download.id).await.unwrap().bytes_downloaded == 1500,
        "progress event not applied"
    );

    // A reordered, older report must not move anything backwards.
    h.transport
        .emit(
            transfer,
            TransferEvent::Progress(TransferUpdate {
                bytes_written: 500,
                total_written: 500,
                total_expected: 2000,
            }),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let d = h.manager.get_download(&download.id).await.unwrap();
    assert_eq!(d.bytes_downloaded, 1500);
    assert_eq!(d.download_progress, 0.75);
}

#[tokio::test]
async fn cancel_removes_immediately_and_ignores_late_events() {
    let h = harness();
    let download = h
        .manager
        .start_download(url("https://example.test/app.ipa"), None)
        .await
        .unwrap();
    let transfer = download.transfer.unwrap();

    h.manager.cancel_download(&download.id).await.unwrap();
    assert!(h.manager.get_download(&download.id).await.is_none());
    assert_eq!(h.transport.state.lock().await.cancelled, vec![transfer]);

    // The engine may still deliver events for the old handle.
    h.transport
        .emit(
            transfer,
            TransferEvent::Progress(TransferUpdate {
                bytes_written: 10,
                total_written: 10,
                total_expected: 100,
            }),
        )
        .await;
    h.transport
        .emit(
            transfer,
            TransferEvent::Completed {
                artifact: h.scratch.path().join("spool").join("ghost.artifact"),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.manager.downloads().await.is_empty());
    assert_eq!(h.pipeline.call_count(), 0);
}

#[tokio::test]
async fn nonresumable_failure_removes_record_without_pipeline() {
    let h = harness();
    let mut events = h.manager.subscribe();
    let download = h
        .manager
        .start_download(url("https://example.test/app.ipa"), None)
        .await
        .unwrap();

    h.transport
        .emit(
            download.transfer.unwrap(),
            TransferEvent::Failed {
                reason: "connection reset".to_string(),
                resume_data: None,
            },
        )
        .await;

    wait_until!(h.manager.downloads().await.is_empty(), "record not removed");
    assert_eq!(h.pipeline.call_count(), 0);

    let event = wait_for_event(&mut events, |e| matches!(e, DownloadEvent::Failed { .. })).await;
    if let DownloadEvent::Failed { id, resumable, .. } = event {
        assert_eq!(id, download.id);
        assert!(!resumable);
    }
}

#[tokio::test]
async fn resumable_interruption_retains_record_for_resume() {
    let h = harness();
    let source = url("https://example.test/app.ipa");
    let download = h.manager.start_download(source.clone(), None).await.unwrap();

    let blob = ResumeData {
        url: source,
        part_path: h.scratch.path().join("spool").join("x.part"),
        bytes_downloaded: 700,
        total_bytes: 2000,
        validator: None,
    };
    h.transport
        .emit(
            download.transfer.unwrap(),
            TransferEvent::Failed {
                reason: "network changed".to_string(),
                resume_data: Some(blob),
            },
        )
        .await;

    wait_until!(
        {
            let d = h.manager.get_download(&download.id).await;
            matches!(&d, Some(d) if d.transfer.is_none() && d.resume_data.is_some())
        },
        "record not retained with resume data"
    );
    assert_eq!(h.manager.downloads().await.len(), 1);

    // Resuming picks the continuation blob over a fresh request.
    h.manager.resume_download(&download.id).await.unwrap();
    let state = h.transport.state.lock().await;
    assert_eq!(state.resumed_blobs.len(), 1);
    assert_eq!(state.resumed_blobs[0].bytes_downloaded, 700);
    drop(state);
    let d = h.manager.get_download(&download.id).await.unwrap();
    assert!(d.transfer.is_some());
    assert!(d.resume_data.is_none());
}

#[tokio::test]
async fn completion_relocates_artifact_and_runs_pipeline() {
    let h = harness();
    let mut events = h.manager.subscribe();
    let download = h
        .manager
        .start_download(url("https://example.test/app.ipa"), None)
        .await
        .unwrap();

    let artifact = spool_artifact(&h, "t.artifact", b"ipa bytes").await;
    h.transport
        .emit(download.transfer.unwrap(), TransferEvent::Completed { artifact })
        .await;

    wait_until!(h.manager.downloads().await.is_empty(), "record not removed");

    let destination = h.working_dir.join(&download.id).join("app.ipa");
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"ipa bytes");
    assert_eq!(h.pipeline.calls.lock().unwrap().as_slice(), &[destination]);

    let event =
        wait_for_event(&mut events, |e| matches!(e, DownloadEvent::Completed { .. })).await;
    if let DownloadEvent::Completed { id, .. } = event {
        assert_eq!(id, download.id);
    }
}

#[tokio::test]
async fn completion_overwrites_previous_artifact() {
    let h = harness();
    let download = h
        .manager
        .start_download(url("https://example.test/app.ipa"), None)
        .await
        .unwrap();

    // Occupy the destination from an earlier run.
    let dir = h.working_dir.join(&download.id);
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("app.ipa"), b"old").await.unwrap();

    let artifact = spool_artifact(&h, "t.artifact", b"new").await;
    h.transport
        .emit(download.transfer.unwrap(), TransferEvent::Completed { artifact })
        .await;

    wait_until!(h.manager.downloads().await.is_empty(), "record not removed");
    assert_eq!(
        tokio::fs::read(dir.join("app.ipa")).await.unwrap(),
        b"new"
    );
}

#[tokio::test]
async fn pipeline_rejection_signals_once_and_still_removes() {
    let h = harness_with(MockPipeline::rejecting());
    let mut events = h.manager.subscribe();
    let download = h
        .manager
        .start_download(url("https://example.test/app.ipa"), None)
        .await
        .unwrap();

    let artifact = spool_artifact(&h, "t.artifact", b"ipa bytes").await;
    h.transport
        .emit(download.transfer.unwrap(), TransferEvent::Completed { artifact })
        .await;

    wait_until!(h.manager.downloads().await.is_empty(), "record not removed");
    assert_eq!(h.pipeline.call_count(), 1);

    wait_for_event(&mut events, |e| matches!(e, DownloadEvent::PipelineFailed { .. })).await;

    // And never a second one.
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, DownloadEvent::PipelineFailed { .. }),
            "failure signal fired twice"
        );
    }
}

#[tokio::test]
async fn relocation_failure_keeps_the_record_and_skips_pipeline() {
    let h = harness();
    let download = h
        .manager
        .start_download(url("https://example.test/app.ipa"), None)
        .await
        .unwrap();

    // Artifact path that does not exist: the rename must fail.
    h.transport
        .emit(
            download.transfer.unwrap(),
            TransferEvent::Completed {
                artifact: h.scratch.path().join("spool").join("missing.artifact"),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.manager.downloads().await.len(), 1);
    assert_eq!(h.pipeline.call_count(), 0);
}

#[tokio::test]
async fn reconcile_rediscovers_and_is_idempotent() {
    let h = harness();
    let first = h
        .transport
        .seed_live(url("https://example.test/a.ipa"), 500, 1000)
        .await;
    h.transport
        .seed_live(url("https://example.test/b.ipa"), 0, 0)
        .await;

    h.manager.reconcile().await.unwrap();
    let downloads = h.manager.downloads().await;
    assert_eq!(downloads.len(), 2);
    let rediscovered = downloads
        .iter()
        .find(|d| d.transfer == Some(first))
        .expect("record for seeded transfer");
    assert_eq!(rediscovered.bytes_downloaded, 500);
    assert_eq!(rediscovered.download_progress, 0.5);
    assert_eq!(rediscovered.display_name, "a.ipa");

    h.manager.reconcile().await.unwrap();
    assert_eq!(h.manager.downloads().await.len(), 2, "reconcile duplicated records");

    // Rediscovered transfers are live again: their events flow.
    h.transport
        .emit(
            first,
            TransferEvent::Progress(TransferUpdate {
                bytes_written: 250,
                total_written: 750,
                total_expected: 1000,
            }),
        )
        .await;
    wait_until!(
        h.manager.get_by_transfer(first).await.unwrap().bytes_downloaded == 750,
        "events from rediscovered transfer not applied"
    );
}

#[tokio::test]
async fn background_callback_fires_once_per_registration() {
    let h = harness();
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = fired.clone();
    h.manager
        .on_background_events_finished(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    h.manager.reconcile().await.unwrap();
    wait_until!(fired.load(Ordering::SeqCst) == 1, "callback did not fire");

    h.manager.reconcile().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1, "one-shot fired twice");

    let counter = fired.clone();
    h.manager
        .on_background_events_finished(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;
    h.manager.reconcile().await.unwrap();
    wait_until!(fired.load(Ordering::SeqCst) == 2, "re-registration did not fire");
}

#[tokio::test]
async fn pause_all_and_resume_all_reach_every_transfer() {
    let h = harness();
    let a = h
        .manager
        .start_download(url("https://example.test/a.ipa"), None)
        .await
        .unwrap();
    let b = h
        .manager
        .start_download(url("https://example.test/b.ipa"), None)
        .await
        .unwrap();
    h.manager.start_archive(url("https://example.test/c.zip"), None).await.unwrap();

    h.manager.pause_all().await;
    h.manager.resume_all().await;

    let state = h.transport.state.lock().await;
    let mut paused = state.paused.clone();
    paused.sort_by_key(|id| id.to_string());
    let mut expected = vec![a.transfer.unwrap(), b.transfer.unwrap()];
    expected.sort_by_key(|id| id.to_string());
    assert_eq!(paused, expected);
    let mut unsuspended = state.unsuspended.clone();
    unsuspended.sort_by_key(|id| id.to_string());
    assert_eq!(unsuspended, expected);
}

#[tokio::test]
async fn archive_only_units_are_driven_by_unpack_progress() {
    let h = harness();
    let download = h
        .manager
        .start_archive(url("https://example.test/bundle.zip"), Some("bundle".to_string()))
        .await
        .unwrap();

    assert!(download.archive_only);
    assert!(download.transfer.is_none());
    assert_eq!(h.transport.begin_count().await, 0);

    h.manager.update_unpack_progress("bundle", 0.4).await.unwrap();
    let d = h.manager.get_download("bundle").await.unwrap();
    assert_eq!(d.unpack_progress, 0.4);
    assert_eq!(d.overall_progress(), 0.4);

    // Stale update: monotonicity holds.
    h.manager.update_unpack_progress("bundle", 0.2).await.unwrap();
    assert_eq!(h.manager.get_download("bundle").await.unwrap().unpack_progress, 0.4);

    // Nothing to resume from on a unit with no network phase.
    assert!(matches!(
        h.manager.resume_download("bundle").await,
        Err(DownloadError::NoResumeData(_))
    ));

    h.manager.remove_download("bundle").await.unwrap();
    assert!(h.manager.get_download("bundle").await.is_none());
}

#[tokio::test]
async fn caller_supplied_duplicate_id_is_rejected() {
    let h = harness();
    h.manager
        .start_download(url("https://example.test/a.ipa"), Some("dup".to_string()))
        .await
        .unwrap();

    let err = h
        .manager
        .start_download(url("https://example.test/b.ipa"), Some("dup".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::Validation(_)));
    assert_eq!(h.manager.downloads().await.len(), 1);
}
