use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use swarm_manifest::DEFAULT_CHUNK_SIZE;

use crate::error::SwarmError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chunk_size: u64,
    pub announce_interval_secs: u64,
    pub max_concurrent_fetches: usize,
    pub chunk_fetch_timeout_secs: u64,
    pub max_retries_per_chunk: u32,
    pub tracker_url: String,
    pub listen_port: u16,
    /// Host announced to the tracker. When unset the tracker records the
    /// address it sees on the connection.
    pub advertise_host: Option<String>,
    pub storage_path: PathBuf,
    pub download_dir: PathBuf,
    /// Announce intervals without a fresh record before a peer is dropped.
    pub peer_ttl_intervals: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            announce_interval_secs: 60,
            max_concurrent_fetches: 6,
            chunk_fetch_timeout_secs: 5,
            max_retries_per_chunk: 5,
            tracker_url: "http://127.0.0.1:5000".to_string(),
            listen_port: 8001,
            advertise_host: None,
            storage_path: PathBuf::from("./swarm-data"),
            download_dir: PathBuf::from("./downloads"),
            peer_ttl_intervals: 3,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), SwarmError> {
        let checks = [
            (self.chunk_size == 0, "chunk_size must be > 0"),
            (self.announce_interval_secs == 0, "announce_interval_secs must be > 0"),
            (self.max_concurrent_fetches == 0, "max_concurrent_fetches must be > 0"),
            (self.chunk_fetch_timeout_secs == 0, "chunk_fetch_timeout_secs must be > 0"),
            (self.max_retries_per_chunk == 0, "max_retries_per_chunk must be > 0"),
            (self.peer_ttl_intervals == 0, "peer_ttl_intervals must be > 0"),
            (self.tracker_url.is_empty(), "tracker_url must be set"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(SwarmError::InvalidInput((*msg).to_string())),
            None => Ok(()),
        }
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn chunk_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_fetch_timeout_secs)
    }

    pub fn peer_ttl(&self) -> Duration {
        self.announce_interval() * self.peer_ttl_intervals
    }

    pub fn load(config_path: &Path) -> anyhow::Result<Option<Self>> {
        if !config_path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read node config {}", config_path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse node config {}", config_path.display()))?;
        Ok(Some(cfg))
    }

    pub fn save(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, raw)
            .with_context(|| format!("failed to write node config {}", config_path.display()))?;
        Ok(())
    }
}
