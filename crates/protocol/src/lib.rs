use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tracker-assigned file identity.
pub type FileId = String;
/// Locally generated peer identity, unique per process lifetime.
pub type PeerId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateFileIdRequest {
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateFileIdResponse {
    pub file_id: FileId,
}

/// Chunk layout of a file as carried by the first announce of a seeder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPayload {
    pub filename: String,
    pub size: u64,
    pub chunk_size: u64,
    pub chunk_hashes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub peer_id: PeerId,
    pub file_id: FileId,
    pub port: u16,
    #[serde(default)]
    pub chunks: Vec<u32>,
    /// Overrides the address the tracker observes on the connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Required only when the tracker has never seen `file_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ManifestPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub filename: String,
    pub size: u64,
    pub chunks: u32,
    pub active_peers: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    pub files: BTreeMap<FileId, FileSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    #[serde(alias = "ip")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub chunks: Vec<u32>,
    /// Unix milliseconds of the peer's most recent announce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfoResponse {
    pub file_id: FileId,
    pub filename: String,
    pub size: u64,
    /// Chunk count.
    pub chunks: u32,
    pub chunk_size: u64,
    pub chunk_hashes: Vec<String>,
    #[serde(default)]
    pub peers: BTreeMap<PeerId, PeerEntry>,
}

/// Query string of the peer-to-peer `GET /chunk` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkQuery {
    pub file_id: FileId,
    pub chunk_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
