use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use swarm_manifest::split;
use swarm_protocol::{FileId, PeerId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::announce::{announce_holdings, spawn_announce_loop, AnnounceIdentity};
use crate::config::NodeConfig;
use crate::directory::SwarmDirectory;
use crate::download::{DownloadCoordinator, DownloadOutcome, DownloadProgress, DownloadSettings};
use crate::error::{Result, SwarmError};
use crate::store::ChunkStore;
use crate::tracker::{Tracker, TrackerClient};
use crate::transfer::{ChunkFetcher, HttpChunkFetcher};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFile {
    pub file_id: FileId,
    pub filename: String,
    pub size: u64,
    pub chunks: u32,
    pub active_peers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveDownloadStatus {
    pub token: u64,
    pub file_id: FileId,
    #[serde(flatten)]
    pub progress: DownloadProgress,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub port: u16,
    pub shared_files: Vec<FileId>,
    pub active_downloads: Vec<ActiveDownloadStatus>,
}

struct ActiveDownload {
    file_id: FileId,
    cancel: Arc<AtomicBool>,
    progress: watch::Receiver<DownloadProgress>,
}

/// Caller's view of one running download.
pub struct DownloadHandle {
    pub token: u64,
    pub file_id: FileId,
    cancel: Arc<AtomicBool>,
    progress: watch::Receiver<DownloadProgress>,
    join: JoinHandle<Result<DownloadOutcome>>,
}

impl DownloadHandle {
    pub fn progress(&self) -> watch::Receiver<DownloadProgress> {
        self.progress.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub async fn wait(self) -> Result<DownloadOutcome> {
        self.join
            .await
            .map_err(|e| SwarmError::Aborted(e.to_string()))?
    }
}

/// Everything one peer process owns. Built once at startup and passed around
/// as `Arc<PeerContext>`.
pub struct PeerContext {
    config: NodeConfig,
    identity: AnnounceIdentity,
    store: Arc<ChunkStore>,
    directory: Arc<SwarmDirectory>,
    tracker: Arc<dyn Tracker>,
    fetcher: Arc<dyn ChunkFetcher>,
    shared: Mutex<BTreeSet<FileId>>,
    announcers: Mutex<HashMap<FileId, JoinHandle<()>>>,
    downloads: Mutex<HashMap<u64, ActiveDownload>>,
    next_token: AtomicU64,
}

impl PeerContext {
    pub fn new(
        config: NodeConfig,
        store: Arc<ChunkStore>,
        tracker: Arc<dyn Tracker>,
        fetcher: Arc<dyn ChunkFetcher>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let peer_id = generate_peer_id();
        let identity = AnnounceIdentity {
            peer_id: peer_id.clone(),
            port: config.listen_port,
            host: config.advertise_host.clone(),
        };
        info!(peer = %peer_id, port = config.listen_port, "Peer context ready");
        Ok(Arc::new(Self {
            directory: Arc::new(SwarmDirectory::new(config.peer_ttl(), Some(peer_id))),
            config,
            identity,
            store,
            tracker,
            fetcher,
            shared: Mutex::new(BTreeSet::new()),
            announcers: Mutex::new(HashMap::new()),
            downloads: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }))
    }

    /// Opens the on-disk store and talks HTTP to the configured tracker.
    pub fn connect(config: NodeConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let store = Arc::new(ChunkStore::open(&config.storage_path)?);
        let tracker = Arc::new(TrackerClient::new(&config.tracker_url)?);
        Self::new(config, store, tracker, Arc::new(HttpChunkFetcher::new()))
    }

    pub fn peer_id(&self) -> &str {
        &self.identity.peer_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<ChunkStore> {
        Arc::clone(&self.store)
    }

    pub fn shared_files(&self) -> Vec<FileId> {
        lock(&self.shared).iter().cloned().collect()
    }

    /// Registers, splits, stores and announces a local file, then keeps
    /// announcing it for as long as the context lives.
    pub async fn share(self: &Arc<Self>, path: &Path) -> Result<FileId> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SwarmError::InvalidInput(format!("no file name in {}", path.display())))?
            .to_string();
        let data = tokio::fs::read(path).await?;
        if data.is_empty() {
            return Err(SwarmError::InvalidInput(format!("{filename} is empty")));
        }

        let file_id = self.tracker.register_file(&filename, data.len() as u64).await?;
        let manifest = split(&file_id, &filename, &data, self.config.chunk_size)?;
        self.store.import_file(&manifest, &data)?;
        announce_holdings(self.tracker.as_ref(), &self.store, &self.identity, &file_id).await?;

        info!(
            %file_id,
            %filename,
            size = manifest.total_size,
            chunks = manifest.chunk_count(),
            "Sharing file"
        );
        self.seed(&file_id);
        Ok(file_id)
    }

    /// Starts seeding every file the store already holds in full.
    pub fn resume_seeding(self: &Arc<Self>) -> Result<Vec<FileId>> {
        let mut resumed = Vec::new();
        for file_id in self.store.known_files()? {
            let Some(manifest) = self.store.manifest(&file_id)? else {
                continue;
            };
            if self.store.has(&file_id)?.len() == manifest.chunk_count() as usize {
                self.seed(&file_id);
                resumed.push(file_id);
            }
        }
        Ok(resumed)
    }

    pub async fn list_remote_files(&self) -> Result<Vec<RemoteFile>> {
        let listing = self.tracker.list_files().await?;
        Ok(listing
            .files
            .into_iter()
            .map(|(file_id, f)| RemoteFile {
                file_id,
                filename: f.filename,
                size: f.size,
                chunks: f.chunks,
                active_peers: f.active_peers,
            })
            .collect())
    }

    pub fn start_download(self: &Arc<Self>, file_id: &str) -> Result<DownloadHandle> {
        if file_id.is_empty() {
            return Err(SwarmError::InvalidInput("file id is empty".into()));
        }
        let coordinator = DownloadCoordinator::new(
            file_id.to_string(),
            DownloadSettings::from_config(&self.config, self.identity.clone()),
            Arc::clone(&self.store),
            Arc::clone(&self.directory),
            Arc::clone(&self.tracker),
            Arc::clone(&self.fetcher),
        );
        let progress = coordinator.subscribe();
        let cancel = coordinator.cancel_flag();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        lock(&self.downloads).insert(
            token,
            ActiveDownload {
                file_id: file_id.to_string(),
                cancel: Arc::clone(&cancel),
                progress: progress.clone(),
            },
        );

        let ctx = Arc::clone(self);
        let id = file_id.to_string();
        let join = tokio::spawn(async move {
            let result = coordinator.run().await;
            lock(&ctx.downloads).remove(&token);
            if let Ok(DownloadOutcome::Completed { .. }) = &result {
                ctx.seed(&id);
            }
            result
        });

        info!(%file_id, token, "Download started");
        Ok(DownloadHandle {
            token,
            file_id: file_id.to_string(),
            cancel,
            progress,
            join,
        })
    }

    pub fn cancel(&self, token: u64) -> Result<()> {
        let downloads = lock(&self.downloads);
        let active = downloads
            .get(&token)
            .ok_or(SwarmError::UnknownSession(token))?;
        active.cancel.store(true, Ordering::SeqCst);
        info!(file_id = %active.file_id, token, "Download cancel requested");
        Ok(())
    }

    pub fn status(&self) -> PeerStatus {
        let mut active_downloads: Vec<_> = lock(&self.downloads)
            .iter()
            .map(|(token, d)| ActiveDownloadStatus {
                token: *token,
                file_id: d.file_id.clone(),
                progress: d.progress.borrow().clone(),
            })
            .collect();
        active_downloads.sort_by_key(|d| d.token);
        PeerStatus {
            peer_id: self.identity.peer_id.clone(),
            port: self.identity.port,
            shared_files: self.shared_files(),
            active_downloads,
        }
    }

    /// Stops announcing, cancels running downloads and flushes the store.
    pub fn shutdown(&self) -> Result<()> {
        for (file_id, task) in lock(&self.announcers).drain() {
            task.abort();
            info!(%file_id, "Stopped announcing");
        }
        for active in lock(&self.downloads).values() {
            active.cancel.store(true, Ordering::SeqCst);
        }
        self.store.flush()
    }

    fn seed(&self, file_id: &str) {
        lock(&self.shared).insert(file_id.to_string());
        let mut announcers = lock(&self.announcers);
        if announcers.contains_key(file_id) {
            return;
        }
        let task = spawn_announce_loop(
            Arc::clone(&self.tracker),
            Arc::clone(&self.store),
            self.identity.clone(),
            file_id.to_string(),
            self.config.announce_interval(),
        );
        announcers.insert(file_id.to_string(), task);
    }
}

impl Drop for PeerContext {
    fn drop(&mut self) {
        for (_, task) in lock(&self.announcers).drain() {
            task.abort();
        }
        if let Err(e) = self.store.flush() {
            warn!("Store flush on drop failed: {e}");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 8 random bytes, hex encoded.
pub fn generate_peer_id() -> PeerId {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFetcher, FakeTracker};
    use swarm_manifest::FileManifest;

    fn config(dir: &Path) -> NodeConfig {
        NodeConfig {
            chunk_size: 64,
            max_concurrent_fetches: 2,
            chunk_fetch_timeout_secs: 1,
            download_dir: dir.join("downloads"),
            storage_path: dir.join("store"),
            ..NodeConfig::default()
        }
    }

    fn sample() -> (FileManifest, Vec<u8>) {
        let data: Vec<u8> = (0..300u32).map(|i| (i % 97) as u8).collect();
        (split("fid", "notes.txt", &data, 64).unwrap(), data)
    }

    #[test]
    fn peer_ids_are_16_hex_chars() {
        let id = generate_peer_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_peer_id());
    }

    #[tokio::test]
    async fn share_stores_and_announces_every_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, data) = sample();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, &data).unwrap();

        let tracker = Arc::new(FakeTracker::new(manifest.clone()));
        let ctx = PeerContext::new(
            config(dir.path()),
            Arc::new(ChunkStore::temporary().unwrap()),
            tracker.clone(),
            Arc::new(FakeFetcher::new(&manifest, &data)),
        )
        .unwrap();

        let file_id = ctx.share(&path).await.unwrap();
        assert_eq!(file_id, "fid");
        assert_eq!(ctx.store().reassemble("fid").unwrap(), data);
        assert_eq!(ctx.shared_files(), vec!["fid".to_string()]);

        let first = &tracker.announces()[0];
        assert_eq!(first.peer_id, ctx.peer_id());
        assert_eq!(first.chunks, (0..5).collect::<Vec<_>>());
        ctx.shutdown().unwrap();
    }

    #[tokio::test]
    async fn share_surfaces_tracker_outage() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, data) = sample();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, &data).unwrap();

        let tracker = Arc::new(FakeTracker::new(manifest.clone()));
        tracker.set_available(false);
        let ctx = PeerContext::new(
            config(dir.path()),
            Arc::new(ChunkStore::temporary().unwrap()),
            tracker,
            Arc::new(FakeFetcher::new(&manifest, &data)),
        )
        .unwrap();

        let err = ctx.share(&path).await.unwrap_err();
        assert!(matches!(err, SwarmError::TrackerUnavailable(_)));
        assert!(ctx.shared_files().is_empty());
    }

    #[tokio::test]
    async fn completed_download_becomes_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, data) = sample();
        let tracker = Arc::new(FakeTracker::new(manifest.clone()).with_peer("seed", 9001, 0..5));
        let ctx = PeerContext::new(
            config(dir.path()),
            Arc::new(ChunkStore::temporary().unwrap()),
            tracker,
            Arc::new(FakeFetcher::new(&manifest, &data)),
        )
        .unwrap();

        let handle = ctx.start_download("fid").unwrap();
        let progress = handle.progress();
        let outcome = handle.wait().await.unwrap();
        let DownloadOutcome::Completed { path } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(path, dir.path().join("downloads").join("notes.txt"));
        assert_eq!(std::fs::read(path).unwrap(), data);
        assert_eq!(progress.borrow().downloaded_chunks, 5);
        assert_eq!(ctx.shared_files(), vec!["fid".to_string()]);
        assert!(ctx.status().active_downloads.is_empty());
    }

    #[tokio::test]
    async fn unknown_token_cannot_be_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, data) = sample();
        let ctx = PeerContext::new(
            config(dir.path()),
            Arc::new(ChunkStore::temporary().unwrap()),
            Arc::new(FakeTracker::new(manifest.clone())),
            Arc::new(FakeFetcher::new(&manifest, &data)),
        )
        .unwrap();
        assert!(matches!(ctx.cancel(42), Err(SwarmError::UnknownSession(42))));
    }

    #[tokio::test]
    async fn resume_seeding_picks_up_complete_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, data) = sample();
        let store = Arc::new(ChunkStore::temporary().unwrap());
        store.import_file(&manifest, &data).unwrap();
        let partial = split("half", "half.bin", &data, 64).unwrap();
        store.register_manifest(&partial).unwrap();
        store.put("half", 0, &data[..64]).unwrap();

        let ctx = PeerContext::new(
            config(dir.path()),
            store,
            Arc::new(FakeTracker::new(manifest.clone())),
            Arc::new(FakeFetcher::new(&manifest, &data)),
        )
        .unwrap();
        assert_eq!(ctx.resume_seeding().unwrap(), vec!["fid".to_string()]);
        ctx.shutdown().unwrap();
    }
}
