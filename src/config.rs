use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::Result;

/// Settings for the download manager and its HTTP transfer engine.
///
/// Values come from, in increasing precedence: built-in defaults, the JSON
/// config file under the platform config directory, and `PACKFETCH_*`
/// environment variables.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ManagerConfig {
    /// Transient location the engine streams partial transfers into.
    pub spool_dir: PathBuf,
    /// Stable per-transfer destination; completed artifacts are moved to
    /// `working_dir/<id>/<display name>` before the pipeline runs.
    pub working_dir: PathBuf,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Capacity of per-transfer progress channels and of the observer
    /// broadcast channel.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            spool_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("./cache"))
                .join("packfetch")
                .join("spool"),
            working_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("./data"))
                .join("packfetch")
                .join("artifacts"),
            user_agent: format!("packfetch/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 15,
            event_capacity: 64,
        }
    }
}

impl ManagerConfig {
    pub fn load() -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&ManagerConfig::default())?);

        if let Some(path) = Self::config_path() {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("PACKFETCH").try_parsing(true))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path().ok_or_else(|| {
            crate::errors::DownloadError::Config(config::ConfigError::Message(
                "Could not find config directory".to_string(),
            ))
        })?;

        if let Some(config_dir) = config_path.parent() {
            if !config_dir.exists() {
                std::fs::create_dir_all(config_dir)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("packfetch").join("config.json"))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
