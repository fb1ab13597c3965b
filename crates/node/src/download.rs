use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swarm_manifest::FileManifest;
use swarm_protocol::{FileId, PeerId};
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::announce::{announce_holdings, AnnounceIdentity};
use crate::config::NodeConfig;
use crate::directory::SwarmDirectory;
use crate::error::{FetchError, Result, SwarmError};
use crate::store::ChunkStore;
use crate::tracker::Tracker;
use crate::transfer::{ChunkFetcher, PeerAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Idle,
    Discovering,
    Fetching,
    Completed,
    Cancelled,
    Failed,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Missing,
    InFlight,
    Verified,
}

/// Snapshot published on every state change and every verified chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadProgress {
    pub state: DownloadState,
    /// Verified chunks over total, in `[0, 1]`.
    pub progress: f64,
    pub downloaded_chunks: u32,
    pub total_chunks: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_chunk: Option<u32>,
}

impl DownloadProgress {
    fn idle() -> Self {
        Self {
            state: DownloadState::Idle,
            progress: 0.0,
            downloaded_chunks: 0,
            total_chunks: 0,
            failed_chunk: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed { path: PathBuf },
    /// Verified chunks stay in the store for a later session.
    Cancelled { verified: u32 },
    Failed { chunk: u32 },
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub max_concurrent_fetches: usize,
    pub chunk_fetch_timeout: Duration,
    pub max_retries_per_chunk: u32,
    /// Period of the in-session re-announce and directory refresh.
    pub refresh_interval: Duration,
    pub download_dir: PathBuf,
    pub identity: AnnounceIdentity,
}

impl DownloadSettings {
    pub fn from_config(cfg: &NodeConfig, identity: AnnounceIdentity) -> Self {
        Self {
            max_concurrent_fetches: cfg.max_concurrent_fetches,
            chunk_fetch_timeout: cfg.chunk_fetch_timeout(),
            max_retries_per_chunk: cfg.max_retries_per_chunk,
            refresh_interval: cfg.announce_interval(),
            download_dir: cfg.download_dir.clone(),
            identity,
        }
    }
}

/// Per-chunk bookkeeping. Owned and mutated by the coordinator task only.
struct Session {
    status: Vec<ChunkStatus>,
    attempts: Vec<u32>,
    failed_peers: Vec<HashSet<PeerId>>,
    /// Peers that served bytes failing verification, for any chunk.
    suspect: HashSet<PeerId>,
    queue: VecDeque<u32>,
    rr_cursor: usize,
    failed_chunk: Option<u32>,
}

impl Session {
    fn resume(manifest: &FileManifest, held: &BTreeSet<u32>) -> Self {
        let total = manifest.chunk_count() as usize;
        let status: Vec<ChunkStatus> = (0..manifest.chunk_count())
            .map(|i| {
                if held.contains(&i) {
                    ChunkStatus::Verified
                } else {
                    ChunkStatus::Missing
                }
            })
            .collect();
        let queue = (0..manifest.chunk_count())
            .filter(|i| status[*i as usize] == ChunkStatus::Missing)
            .collect();
        Self {
            status,
            attempts: vec![0; total],
            failed_peers: vec![HashSet::new(); total],
            suspect: HashSet::new(),
            queue,
            rr_cursor: 0,
            failed_chunk: None,
        }
    }

    fn verified(&self) -> u32 {
        self.status
            .iter()
            .filter(|s| **s == ChunkStatus::Verified)
            .count() as u32
    }

    fn total(&self) -> u32 {
        self.status.len() as u32
    }
}

struct Attempt {
    index: u32,
    peer_id: PeerId,
    result: std::result::Result<bytes::Bytes, FetchError>,
}

/// Drives one download from discovery to a reassembled file.
pub struct DownloadCoordinator {
    file_id: FileId,
    settings: DownloadSettings,
    store: Arc<ChunkStore>,
    directory: Arc<SwarmDirectory>,
    tracker: Arc<dyn Tracker>,
    fetcher: Arc<dyn ChunkFetcher>,
    cancel: Arc<AtomicBool>,
    progress: watch::Sender<DownloadProgress>,
}

impl DownloadCoordinator {
    pub fn new(
        file_id: FileId,
        settings: DownloadSettings,
        store: Arc<ChunkStore>,
        directory: Arc<SwarmDirectory>,
        tracker: Arc<dyn Tracker>,
        fetcher: Arc<dyn ChunkFetcher>,
    ) -> Self {
        let (progress, _) = watch::channel(DownloadProgress::idle());
        Self {
            file_id,
            settings,
            store,
            directory,
            tracker,
            fetcher,
            cancel: Arc::new(AtomicBool::new(false)),
            progress,
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadProgress> {
        self.progress.subscribe()
    }

    /// Setting the flag stops new fetches and discards results still in flight.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub async fn run(self) -> Result<DownloadOutcome> {
        match self.drive().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(file_id = %self.file_id, "Download aborted: {e}");
                self.progress.send_modify(|p| p.state = DownloadState::Failed);
                Err(e)
            }
        }
    }

    async fn drive(&self) -> Result<DownloadOutcome> {
        self.publish_state(DownloadState::Discovering, 0, 0, None);
        let manifest = self.discover().await?;

        let held = self.store.has(&self.file_id)?;
        let mut session = Session::resume(&manifest, &held);
        if self.cancelled() {
            return Ok(self.finish_cancelled(&session));
        }
        if !session.queue.is_empty() && self.directory.peers(&self.file_id).is_empty() {
            return Err(SwarmError::NoPeersAvailable(self.file_id.clone()));
        }

        info!(
            file_id = %self.file_id,
            total = session.total(),
            resumed = session.verified(),
            "Fetching chunks"
        );
        self.publish(&session, DownloadState::Fetching);

        let mut in_flight = FuturesUnordered::new();
        let period = self.settings.refresh_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Advertise resumed chunks now rather than one period in.
        self.refresh(true).await;

        loop {
            while session.failed_chunk.is_none()
                && !self.cancelled()
                && in_flight.len() < self.settings.max_concurrent_fetches
            {
                let Some(index) = session.queue.pop_front() else {
                    break;
                };
                match self.pick_peer(&mut session, index).await {
                    Some((peer_id, addr)) => {
                        debug!(file_id = %self.file_id, chunk = index, peer = %peer_id, "Requesting chunk");
                        session.status[index as usize] = ChunkStatus::InFlight;
                        in_flight.push(self.attempt(index, peer_id, addr));
                    }
                    None => {
                        warn!(file_id = %self.file_id, chunk = index, "No peer holds chunk");
                        session.failed_chunk = Some(index);
                    }
                }
            }

            if in_flight.is_empty() {
                if self.cancelled() {
                    return Ok(self.finish_cancelled(&session));
                }
                if let Some(chunk) = session.failed_chunk {
                    warn!(file_id = %self.file_id, chunk, "Download failed");
                    self.publish_state(
                        DownloadState::Failed,
                        session.verified(),
                        session.total(),
                        Some(chunk),
                    );
                    return Ok(DownloadOutcome::Failed { chunk });
                }
                if session.queue.is_empty() {
                    break;
                }
            }

            tokio::select! {
                Some(attempt) = in_flight.next() => self.settle(&mut session, attempt)?,
                _ = ticker.tick() => self.refresh(true).await,
            }
        }

        self.complete(&session).await
    }

    async fn discover(&self) -> Result<Arc<FileManifest>> {
        let info = self.tracker.file_info(&self.file_id).await?;
        info.manifest.validate()?;
        if info.manifest.file_id != self.file_id {
            return Err(SwarmError::InvalidInput(format!(
                "tracker answered for {} instead of {}",
                info.manifest.file_id, self.file_id
            )));
        }
        self.store.register_manifest(&info.manifest)?;
        self.directory.ingest(&self.file_id, &info.peers);
        debug!(file_id = %self.file_id, peers = info.peers.len(), "Swarm discovered");
        self.store
            .manifest(&self.file_id)?
            .ok_or_else(|| SwarmError::UnknownFile(self.file_id.clone()))
    }

    /// Round-robin over holders of `index`. Prefers peers that neither
    /// failed this chunk nor served corrupt data this session, then any peer
    /// that has not failed this chunk, then anyone holding it.
    async fn pick_peer(&self, session: &mut Session, index: u32) -> Option<(PeerId, PeerAddr)> {
        let mut candidates = self.directory.peers_holding(&self.file_id, index);
        if candidates.is_empty() {
            self.refresh(false).await;
            candidates = self.directory.peers_holding(&self.file_id, index);
        }
        if candidates.is_empty() {
            return None;
        }

        let failed = &session.failed_peers[index as usize];
        let untried: Vec<_> = candidates
            .iter()
            .filter(|(id, _)| !failed.contains(id))
            .cloned()
            .collect();
        let trusted: Vec<_> = untried
            .iter()
            .filter(|(id, _)| !session.suspect.contains(id))
            .cloned()
            .collect();
        let pool = if !trusted.is_empty() {
            trusted
        } else if !untried.is_empty() {
            untried
        } else {
            candidates
        };
        let pick = pool[session.rr_cursor % pool.len()].clone();
        session.rr_cursor = session.rr_cursor.wrapping_add(1);
        Some(pick)
    }

    fn attempt(
        &self,
        index: u32,
        peer_id: PeerId,
        addr: PeerAddr,
    ) -> impl std::future::Future<Output = Attempt> + Send + 'static {
        let fetcher = Arc::clone(&self.fetcher);
        let file_id = self.file_id.clone();
        let limit = self.settings.chunk_fetch_timeout;
        async move {
            let result = match time::timeout(limit, fetcher.fetch_chunk(&addr, &file_id, index)).await {
                Ok(r) => r,
                Err(_) => Err(FetchError::Timeout),
            };
            Attempt {
                index,
                peer_id,
                result,
            }
        }
    }

    fn settle(&self, session: &mut Session, attempt: Attempt) -> Result<()> {
        let Attempt {
            index,
            peer_id,
            result,
        } = attempt;
        let slot = index as usize;
        if self.cancelled() {
            session.status[slot] = ChunkStatus::Missing;
            return Ok(());
        }

        let reason = match result {
            Ok(bytes) => match self.store.put(&self.file_id, index, &bytes) {
                Ok(_) => {
                    session.status[slot] = ChunkStatus::Verified;
                    self.publish(session, DownloadState::Fetching);
                    return Ok(());
                }
                Err(SwarmError::HashMismatch { .. }) => {
                    session.suspect.insert(peer_id.clone());
                    "hash mismatch".to_string()
                }
                Err(e) => return Err(e),
            },
            Err(e) => e.to_string(),
        };

        session.status[slot] = ChunkStatus::Missing;
        session.failed_peers[slot].insert(peer_id.clone());
        session.attempts[slot] += 1;
        warn!(
            file_id = %self.file_id,
            chunk = index,
            peer = %peer_id,
            attempt = session.attempts[slot],
            "Chunk fetch failed: {reason}"
        );

        if session.failed_chunk.is_some() {
            return Ok(());
        }
        if session.attempts[slot] >= self.settings.max_retries_per_chunk {
            session.failed_chunk = Some(index);
        } else {
            session.queue.push_back(index);
        }
        Ok(())
    }

    /// Re-polls the tracker; with `announce` also advertises current holdings.
    async fn refresh(&self, announce: bool) {
        if announce {
            if let Err(e) = announce_holdings(
                self.tracker.as_ref(),
                &self.store,
                &self.settings.identity,
                &self.file_id,
            )
            .await
            {
                warn!(file_id = %self.file_id, "Announce failed: {e}");
            }
        }
        match self.tracker.file_info(&self.file_id).await {
            Ok(info) => self.directory.ingest(&self.file_id, &info.peers),
            Err(e) => warn!(file_id = %self.file_id, "Peer refresh failed: {e}"),
        }
    }

    async fn complete(&self, session: &Session) -> Result<DownloadOutcome> {
        let path = self
            .store
            .write_reassembled(&self.file_id, &self.settings.download_dir)?;
        if let Err(e) = announce_holdings(
            self.tracker.as_ref(),
            &self.store,
            &self.settings.identity,
            &self.file_id,
        )
        .await
        {
            warn!(file_id = %self.file_id, "Final announce failed: {e}");
        }
        info!(file_id = %self.file_id, path = %path.display(), "Download complete");
        self.publish(session, DownloadState::Completed);
        Ok(DownloadOutcome::Completed { path })
    }

    fn finish_cancelled(&self, session: &Session) -> DownloadOutcome {
        info!(file_id = %self.file_id, verified = session.verified(), "Download cancelled");
        self.publish(session, DownloadState::Cancelled);
        DownloadOutcome::Cancelled {
            verified: session.verified(),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn publish(&self, session: &Session, state: DownloadState) {
        self.publish_state(state, session.verified(), session.total(), None);
    }

    fn publish_state(&self, state: DownloadState, verified: u32, total: u32, failed_chunk: Option<u32>) {
        let progress = if total == 0 {
            0.0
        } else {
            f64::from(verified) / f64::from(total)
        };
        self.progress.send_replace(DownloadProgress {
            state,
            progress,
            downloaded_chunks: verified,
            total_chunks: total,
            failed_chunk,
        });
    }
}
