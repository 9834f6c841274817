//! packfetch is a resumable, concurrent download manager core.
//!
//! A [`DownloadManager`] tracks in-flight transfers as an observable
//! collection of [`Download`] records, drives them through a [`Transport`]
//! façade over a detachable HTTP engine, and hands finished artifacts to
//! an [`ArtifactPipeline`] collaborator. Transfers keep running while no
//! manager is attached; [`DownloadManager::reconcile`] re-synchronizes the
//! collection with the engine's live transfer list afterwards.
//!
//! ```no_run
//! use std::sync::Arc;
//! use packfetch::{DownloadManager, HttpTransport, LoggingPipeline, ManagerConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> packfetch::Result<()> {
//! let config = ManagerConfig::default();
//! let transport = Arc::new(HttpTransport::new(&config)?);
//! let manager = DownloadManager::new(transport, Arc::new(LoggingPipeline), config);
//!
//! let url = url::Url::parse("https://example.test/app.ipa").unwrap();
//! let download = manager.start_download(url, None).await?;
//! println!("tracking {}", download.id);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod downloader;
pub mod errors;
pub mod pipeline;
pub mod transport;
pub mod utils;

pub use config::ManagerConfig;
pub use downloader::manager::DownloadManager;
pub use downloader::{Download, DownloadEvent};
pub use errors::{DownloadError, Result};
pub use pipeline::{ArtifactPipeline, LoggingPipeline};
pub use transport::http::HttpTransport;
pub use transport::{
    LiveTransfer, ResumeData, Transfer, TransferEvent, TransferId, TransferUpdate, Transport,
};
