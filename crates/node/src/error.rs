use swarm_manifest::ManifestError;
use swarm_protocol::FileId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("tracker unavailable: {0}")]
    TrackerUnavailable(String),
    #[error("chunk {index} of {file_id} failed hash verification")]
    HashMismatch { file_id: FileId, index: u32 },
    #[error("no peers available for {0}")]
    NoPeersAvailable(FileId),
    #[error("file {file_id} incomplete: chunk {first_missing} is missing")]
    Incomplete { file_id: FileId, first_missing: u32 },
    #[error("chunk {index} of {file_id} not found")]
    NotFound { file_id: FileId, index: u32 },
    #[error("unknown file {0}")]
    UnknownFile(FileId),
    #[error("unknown download session {0}")]
    UnknownSession(u64),
    #[error("download task aborted: {0}")]
    Aborted(String),
    #[error("corrupt store record: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Failure of one chunk request to one peer. Recovered by the coordinator,
/// never surfaced to callers on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("chunk fetch timed out")]
    Timeout,
    #[error("peer does not hold the chunk")]
    NotFound,
    #[error("peer answered with status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, SwarmError>;
