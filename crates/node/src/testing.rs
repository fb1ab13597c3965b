//! In-process stand-ins for the tracker and remote peers.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swarm_manifest::{FileManifest, chunk_slices};
use swarm_protocol::{AnnounceRequest, FileId, FileSummary, ListResponse, PeerEntry, PeerId};

use crate::error::{FetchError, Result, SwarmError};
use crate::tracker::{FileInfo, Tracker};
use crate::transfer::{ChunkFetcher, PeerAddr};

pub struct FakeTracker {
    manifest: FileManifest,
    peers: Mutex<BTreeMap<PeerId, PeerEntry>>,
    announces: Mutex<Vec<AnnounceRequest>>,
    failed_announces: AtomicUsize,
    available: AtomicBool,
}

impl FakeTracker {
    pub fn new(manifest: FileManifest) -> Self {
        Self {
            manifest,
            peers: Mutex::new(BTreeMap::new()),
            announces: Mutex::new(Vec::new()),
            failed_announces: AtomicUsize::new(0),
            available: AtomicBool::new(true),
        }
    }

    pub fn with_peer(self, peer_id: &str, port: u16, chunks: impl IntoIterator<Item = u32>) -> Self {
        self.peers.lock().unwrap().insert(
            peer_id.to_string(),
            PeerEntry {
                host: "127.0.0.1".into(),
                port,
                chunks: chunks.into_iter().collect(),
                last_seen: None,
            },
        );
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn announces(&self) -> Vec<AnnounceRequest> {
        self.announces.lock().unwrap().clone()
    }

    pub fn failed_announces(&self) -> usize {
        self.failed_announces.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SwarmError::TrackerUnavailable("connection refused".into()))
        }
    }
}

#[async_trait]
impl Tracker for FakeTracker {
    async fn register_file(&self, _filename: &str, _size: u64) -> Result<FileId> {
        self.check_available()?;
        Ok(self.manifest.file_id.clone())
    }

    async fn announce(&self, req: &AnnounceRequest) -> Result<()> {
        if let Err(e) = self.check_available() {
            self.failed_announces.fetch_add(1, Ordering::SeqCst);
            return Err(e);
        }
        self.announces.lock().unwrap().push(req.clone());
        Ok(())
    }

    async fn list_files(&self) -> Result<ListResponse> {
        self.check_available()?;
        let summary = FileSummary {
            filename: self.manifest.filename.clone(),
            size: self.manifest.total_size,
            chunks: self.manifest.chunk_count(),
            active_peers: self.peers.lock().unwrap().len(),
        };
        Ok(ListResponse {
            files: BTreeMap::from([(self.manifest.file_id.clone(), summary)]),
        })
    }

    async fn file_info(&self, file_id: &str) -> Result<FileInfo> {
        self.check_available()?;
        if file_id != self.manifest.file_id {
            return Err(SwarmError::UnknownFile(file_id.to_string()));
        }
        Ok(FileInfo {
            manifest: self.manifest.clone(),
            peers: self.peers.lock().unwrap().clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Serve,
    Corrupt,
    Fail,
    Hang,
}

/// Serves chunks of one file, with per-peer and per-chunk misbehaviour.
pub struct FakeFetcher {
    chunks: Vec<Bytes>,
    per_peer: HashMap<u16, Behavior>,
    per_chunk: HashMap<(u16, u32), Behavior>,
    calls: Mutex<Vec<(u16, u32)>>,
    trip: Option<(u32, Arc<AtomicBool>)>,
}

impl FakeFetcher {
    pub fn new(manifest: &FileManifest, data: &[u8]) -> Self {
        Self {
            chunks: chunk_slices(manifest, data)
                .map(|(_, s)| Bytes::copy_from_slice(s))
                .collect(),
            per_peer: HashMap::new(),
            per_chunk: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            trip: None,
        }
    }

    pub fn peer(mut self, port: u16, behavior: Behavior) -> Self {
        self.per_peer.insert(port, behavior);
        self
    }

    pub fn chunk(mut self, port: u16, index: u32, behavior: Behavior) -> Self {
        self.per_chunk.insert((port, index), behavior);
        self
    }

    /// Raises `flag` when `index` is requested.
    pub fn trip_on(mut self, index: u32, flag: Arc<AtomicBool>) -> Self {
        self.trip = Some((index, flag));
        self
    }

    pub fn calls(&self) -> Vec<(u16, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, index: u32) -> usize {
        self.calls().iter().filter(|(_, i)| *i == index).count()
    }
}

#[async_trait]
impl ChunkFetcher for FakeFetcher {
    async fn fetch_chunk(
        &self,
        peer: &PeerAddr,
        _file_id: &str,
        index: u32,
    ) -> std::result::Result<Bytes, FetchError> {
        self.calls.lock().unwrap().push((peer.port, index));
        if let Some((at, flag)) = &self.trip {
            if *at == index {
                flag.store(true, Ordering::SeqCst);
            }
        }

        let behavior = self
            .per_chunk
            .get(&(peer.port, index))
            .or_else(|| self.per_peer.get(&peer.port))
            .copied()
            .unwrap_or(Behavior::Serve);
        let Some(bytes) = self.chunks.get(index as usize).cloned() else {
            return Err(FetchError::NotFound);
        };

        match behavior {
            Behavior::Serve => Ok(bytes),
            Behavior::Corrupt => {
                let mut bad = bytes.to_vec();
                bad[0] ^= 0xff;
                Ok(Bytes::from(bad))
            }
            Behavior::Fail => Err(FetchError::Transport("connection reset".into())),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(FetchError::Timeout)
            }
        }
    }
}
