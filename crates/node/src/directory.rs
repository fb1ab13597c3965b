use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use swarm_protocol::{FileId, PeerEntry, PeerId};

use crate::transfer::PeerAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub addr: PeerAddr,
    pub chunks_held: BTreeSet<u32>,
    /// Unix milliseconds.
    pub last_announce_at: i64,
}

/// Local view of who holds which chunks, refreshed from tracker polls.
pub struct SwarmDirectory {
    ttl_ms: i64,
    local_peer: Option<PeerId>,
    files: RwLock<HashMap<FileId, HashMap<PeerId, PeerRecord>>>,
}

impl SwarmDirectory {
    pub fn new(ttl: Duration, local_peer: Option<PeerId>) -> Self {
        Self {
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            local_peer,
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn ingest(&self, file_id: &str, peers: &BTreeMap<PeerId, PeerEntry>) {
        self.ingest_at(file_id, peers, now_ms());
    }

    /// Each polled entry replaces the previous record for that peer outright.
    pub fn ingest_at(&self, file_id: &str, peers: &BTreeMap<PeerId, PeerEntry>, now_ms: i64) {
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        let swarm = files.entry(file_id.to_string()).or_default();
        for (peer_id, entry) in peers {
            if self.local_peer.as_ref() == Some(peer_id) {
                continue;
            }
            swarm.insert(
                peer_id.clone(),
                PeerRecord {
                    addr: PeerAddr::new(entry.host.clone(), entry.port),
                    chunks_held: entry.chunks.iter().copied().collect(),
                    last_announce_at: entry.last_seen.unwrap_or(now_ms),
                },
            );
        }
    }

    pub fn peers_holding(&self, file_id: &str, index: u32) -> Vec<(PeerId, PeerAddr)> {
        self.peers_holding_at(file_id, index, now_ms())
    }

    /// Candidates for fetching `index`, ordered by peer id.
    pub fn peers_holding_at(&self, file_id: &str, index: u32, now_ms: i64) -> Vec<(PeerId, PeerAddr)> {
        self.peers_at(file_id, now_ms)
            .into_iter()
            .filter(|(_, rec)| rec.chunks_held.contains(&index))
            .map(|(id, rec)| (id, rec.addr))
            .collect()
    }

    pub fn peers(&self, file_id: &str) -> Vec<(PeerId, PeerRecord)> {
        self.peers_at(file_id, now_ms())
    }

    /// Live records for `file_id`; expired ones are pruned first.
    pub fn peers_at(&self, file_id: &str, now_ms: i64) -> Vec<(PeerId, PeerRecord)> {
        self.prune_expired(file_id, now_ms);
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = files
            .get(file_id)
            .map(|swarm| swarm.iter().map(|(id, rec)| (id.clone(), rec.clone())).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn prune_expired(&self, file_id: &str, now_ms: i64) {
        let ttl_ms = self.ttl_ms;
        let is_live = |rec: &PeerRecord| now_ms.saturating_sub(rec.last_announce_at) <= ttl_ms;

        let stale = {
            let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
            files
                .get(file_id)
                .is_some_and(|swarm| swarm.values().any(|rec| !is_live(rec)))
        };
        if stale {
            let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(swarm) = files.get_mut(file_id) {
                swarm.retain(|_, rec| is_live(&*rec));
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(port: u16, chunks: &[u32], last_seen: Option<i64>) -> PeerEntry {
        PeerEntry {
            host: "127.0.0.1".into(),
            port,
            chunks: chunks.to_vec(),
            last_seen,
        }
    }

    #[test]
    fn reannounce_replaces_instead_of_merging() {
        let dir = SwarmDirectory::new(Duration::from_secs(180), None);
        dir.ingest_at("f", &BTreeMap::from([("p1".to_string(), entry(8001, &[0, 1], None))]), 1_000);
        dir.ingest_at("f", &BTreeMap::from([("p1".to_string(), entry(8001, &[0, 1, 2], None))]), 2_000);

        let peers = dir.peers_at("f", 2_000);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].1.chunks_held, BTreeSet::from([0, 1, 2]));

        dir.ingest_at("f", &BTreeMap::from([("p1".to_string(), entry(8001, &[2], None))]), 3_000);
        assert!(dir.peers_holding_at("f", 0, 3_000).is_empty());
    }

    #[test]
    fn same_announce_twice_is_idempotent() {
        let dir = SwarmDirectory::new(Duration::from_secs(180), None);
        let poll = BTreeMap::from([("p1".to_string(), entry(8001, &[0, 2], Some(500)))]);
        dir.ingest_at("f", &poll, 1_000);
        let once = dir.peers_at("f", 1_000);
        dir.ingest_at("f", &poll, 1_000);
        assert_eq!(dir.peers_at("f", 1_000), once);
    }

    #[test]
    fn expired_records_fall_out_on_read() {
        let dir = SwarmDirectory::new(Duration::from_secs(3), None);
        let poll = BTreeMap::from([
            ("old".to_string(), entry(8001, &[0], Some(0))),
            ("new".to_string(), entry(8002, &[0], Some(2_500))),
        ]);
        dir.ingest_at("f", &poll, 2_500);

        let holders: Vec<_> = dir.peers_holding_at("f", 0, 3_500).into_iter().map(|(id, _)| id).collect();
        assert_eq!(holders, vec!["new".to_string()]);
        assert_eq!(dir.peers_at("f", 3_500).len(), 1);
    }

    #[test]
    fn local_peer_is_never_a_candidate() {
        let dir = SwarmDirectory::new(Duration::from_secs(180), Some("me".into()));
        let poll = BTreeMap::from([
            ("me".to_string(), entry(8001, &[0], None)),
            ("them".to_string(), entry(8002, &[0], None)),
        ]);
        dir.ingest_at("f", &poll, 0);
        let holders = dir.peers_holding_at("f", 0, 0);
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].1, PeerAddr::new("127.0.0.1", 8002));
    }
}
