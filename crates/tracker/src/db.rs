use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use swarm_protocol::{
    AnnounceRequest, FileId, FileInfoResponse, FileSummary, ListResponse, PeerEntry, PeerId,
};

use crate::error::TrackerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSeen {
    pub host: String,
    pub port: u16,
    pub chunks: Vec<u32>,
    pub last_seen: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub size: u64,
    pub chunk_size: u64,
    pub chunk_hashes: Vec<String>,
    pub created_at: i64,
    pub peers: BTreeMap<PeerId, PeerSeen>,
}

impl FileRecord {
    fn chunk_count(&self) -> u32 {
        self.chunk_hashes.len() as u32
    }

    fn active_peers(&self, now_ms: i64, window_ms: i64) -> impl Iterator<Item = (&PeerId, &PeerSeen)> {
        self.peers
            .iter()
            .filter(move |(_, p)| now_ms.saturating_sub(p.last_seen) < window_ms)
    }
}

/// Swarm membership for every known file, keyed by file id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerDb {
    pub files: BTreeMap<FileId, FileRecord>,
}

impl TrackerDb {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Upserts `req.peer_id` as a member of `req.file_id`, replacing any
    /// earlier record for that peer.
    pub fn announce(
        &mut self,
        req: AnnounceRequest,
        observed_host: String,
        now_ms: i64,
    ) -> Result<(), TrackerError> {
        if req.peer_id.is_empty() || req.file_id.is_empty() || req.port == 0 {
            return Err(TrackerError::BadRequest("Missing required fields".into()));
        }

        if !self.files.contains_key(&req.file_id) {
            let Some(manifest) = req.manifest.as_ref() else {
                return Err(TrackerError::FileNotFound);
            };
            let expected = manifest.size.div_ceil(manifest.chunk_size.max(1));
            if manifest.size == 0
                || manifest.chunk_size == 0
                || expected != manifest.chunk_hashes.len() as u64
            {
                return Err(TrackerError::BadRequest("Inconsistent manifest".into()));
            }
            self.files.insert(
                req.file_id.clone(),
                FileRecord {
                    filename: manifest.filename.clone(),
                    size: manifest.size,
                    chunk_size: manifest.chunk_size,
                    chunk_hashes: manifest.chunk_hashes.clone(),
                    created_at: now_ms,
                    peers: BTreeMap::new(),
                },
            );
        }

        let Some(file) = self.files.get_mut(&req.file_id) else {
            return Err(TrackerError::FileNotFound);
        };

        let mut chunks = req.chunks;
        chunks.sort_unstable();
        chunks.dedup();
        if let Some(&bad) = chunks.iter().find(|&&c| c >= file.chunk_count()) {
            return Err(TrackerError::BadRequest(format!(
                "chunk {bad} out of range"
            )));
        }

        file.peers.insert(
            req.peer_id,
            PeerSeen {
                host: req.host.unwrap_or(observed_host),
                port: req.port,
                chunks,
                last_seen: now_ms,
            },
        );
        Ok(())
    }

    pub fn list(&self, now_ms: i64, window_ms: i64) -> ListResponse {
        let files = self
            .files
            .iter()
            .map(|(id, f)| {
                (
                    id.clone(),
                    FileSummary {
                        filename: f.filename.clone(),
                        size: f.size,
                        chunks: f.chunk_count(),
                        active_peers: f.active_peers(now_ms, window_ms).count(),
                    },
                )
            })
            .collect();
        ListResponse { files }
    }

    pub fn file_info(&self, file_id: &str, now_ms: i64, window_ms: i64) -> Option<FileInfoResponse> {
        let f = self.files.get(file_id)?;
        let peers = f
            .active_peers(now_ms, window_ms)
            .map(|(id, p)| {
                (
                    id.clone(),
                    PeerEntry {
                        host: p.host.clone(),
                        port: p.port,
                        chunks: p.chunks.clone(),
                        last_seen: Some(p.last_seen),
                    },
                )
            })
            .collect();
        Some(FileInfoResponse {
            file_id: file_id.to_string(),
            filename: f.filename.clone(),
            size: f.size,
            chunks: f.chunk_count(),
            chunk_size: f.chunk_size,
            chunk_hashes: f.chunk_hashes.clone(),
            peers,
        })
    }
}

/// 16 hex characters of SHA-256 over `filename-size-nanos`.
pub fn generate_file_id(filename: &str, size: u64, nanos: i64) -> FileId {
    let mut hasher = Sha256::new();
    hasher.update(format!("{filename}-{size}-{nanos}").as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}
