use std::sync::Arc;
use std::time::Duration;
use swarm_protocol::{AnnounceRequest, FileId, PeerId};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::ChunkStore;
use crate::tracker::Tracker;

/// How this peer presents itself in announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceIdentity {
    pub peer_id: PeerId,
    pub port: u16,
    pub host: Option<String>,
}

/// Announces every verified chunk of `file_id` currently in the store.
///
/// The manifest rides along so a tracker that lost its state can rebuild
/// the file entry from any member's announce.
pub async fn announce_holdings(
    tracker: &dyn Tracker,
    store: &ChunkStore,
    me: &AnnounceIdentity,
    file_id: &str,
) -> Result<usize> {
    let chunks: Vec<u32> = store.has(file_id)?.into_iter().collect();
    let manifest = store.manifest(file_id)?.map(|m| m.to_payload());
    let held = chunks.len();
    tracker
        .announce(&AnnounceRequest {
            peer_id: me.peer_id.clone(),
            file_id: file_id.to_string(),
            port: me.port,
            chunks,
            host: me.host.clone(),
            manifest,
        })
        .await?;
    Ok(held)
}

pub fn spawn_announce_loop(
    tracker: Arc<dyn Tracker>,
    store: Arc<ChunkStore>,
    me: AnnounceIdentity,
    file_id: FileId,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(%file_id, period_secs = period.as_secs(), "Starting periodic announcements");
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match announce_holdings(tracker.as_ref(), &store, &me, &file_id).await {
                Ok(held) => debug!(%file_id, held, "Announced"),
                // The next tick re-sends the same state.
                Err(e) => warn!(%file_id, "Announce failed: {e}"),
            }
        }
    })
}
