use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::Serialize;
use std::fmt;
use swarm_protocol::ChunkQuery;

use crate::error::FetchError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Reads one chunk from one remote peer.
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    async fn fetch_chunk(
        &self,
        peer: &PeerAddr,
        file_id: &str,
        index: u32,
    ) -> Result<Bytes, FetchError>;
}

/// Client side of the peer endpoint's `GET /chunk` route.
#[derive(Clone, Default)]
pub struct HttpChunkFetcher {
    http: reqwest::Client,
}

impl HttpChunkFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkFetcher for HttpChunkFetcher {
    async fn fetch_chunk(
        &self,
        peer: &PeerAddr,
        file_id: &str,
        index: u32,
    ) -> Result<Bytes, FetchError> {
        let res = self
            .http
            .get(format!("{}/chunk", peer.base_url()))
            .query(&ChunkQuery {
                file_id: file_id.to_string(),
                chunk_index: index,
            })
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        match res.status() {
            StatusCode::OK => res
                .bytes()
                .await
                .map_err(|e| FetchError::Transport(e.to_string())),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            other => Err(FetchError::Status(other.as_u16())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_hosts_are_bracketed() {
        assert_eq!(PeerAddr::new("::1", 8001).base_url(), "http://[::1]:8001");
        assert_eq!(
            PeerAddr::new("10.0.0.2", 8002).base_url(),
            "http://10.0.0.2:8002"
        );
    }
}
