use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::time::Duration;
use swarm_manifest::FileManifest;
use swarm_protocol::{
    AnnounceRequest, AnnounceResponse, FileId, FileInfoResponse, GenerateFileIdRequest,
    GenerateFileIdResponse, ListResponse, PeerEntry, PeerId,
};

use crate::error::{Result, SwarmError};

const TRACKER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Manifest plus current swarm members, as reported by the tracker.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub manifest: FileManifest,
    pub peers: BTreeMap<PeerId, PeerEntry>,
}

impl FileInfo {
    pub fn from_response(info: FileInfoResponse) -> Result<Self> {
        let manifest = FileManifest::from_file_info(&info)?;
        Ok(Self {
            manifest,
            peers: info.peers,
        })
    }
}

#[async_trait]
pub trait Tracker: Send + Sync {
    async fn register_file(&self, filename: &str, size: u64) -> Result<FileId>;

    /// Idempotent upsert of this peer's holdings for one file.
    async fn announce(&self, req: &AnnounceRequest) -> Result<()>;

    async fn list_files(&self) -> Result<ListResponse>;

    async fn file_info(&self, file_id: &str) -> Result<FileInfo>;
}

pub struct TrackerClient {
    http: reqwest::Client,
    base_url: String,
}

impl TrackerClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(TRACKER_REQUEST_TIMEOUT)
            .build()
            .map_err(unavailable)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Tracker for TrackerClient {
    async fn register_file(&self, filename: &str, size: u64) -> Result<FileId> {
        let res = self
            .http
            .post(self.url("/generate_file_id"))
            .json(&GenerateFileIdRequest {
                filename: filename.to_string(),
                size,
            })
            .send()
            .await
            .map_err(unavailable)?;
        let body: GenerateFileIdResponse = expect_ok(res).await?.json().await.map_err(unavailable)?;
        Ok(body.file_id)
    }

    async fn announce(&self, req: &AnnounceRequest) -> Result<()> {
        let res = self
            .http
            .post(self.url("/announce"))
            .json(req)
            .send()
            .await
            .map_err(unavailable)?;
        if res.status() == StatusCode::NOT_FOUND {
            return Err(SwarmError::UnknownFile(req.file_id.clone()));
        }
        let body: AnnounceResponse = expect_ok(res).await?.json().await.map_err(unavailable)?;
        if !body.ok {
            return Err(SwarmError::TrackerUnavailable("announce not acknowledged".into()));
        }
        Ok(())
    }

    async fn list_files(&self) -> Result<ListResponse> {
        let res = self
            .http
            .get(self.url("/list"))
            .send()
            .await
            .map_err(unavailable)?;
        expect_ok(res).await?.json().await.map_err(unavailable)
    }

    async fn file_info(&self, file_id: &str) -> Result<FileInfo> {
        let res = self
            .http
            .get(self.url(&format!("/file/{file_id}")))
            .send()
            .await
            .map_err(unavailable)?;
        if res.status() == StatusCode::NOT_FOUND {
            return Err(SwarmError::UnknownFile(file_id.to_string()));
        }
        let info: FileInfoResponse = expect_ok(res).await?.json().await.map_err(unavailable)?;
        FileInfo::from_response(info)
    }
}

async fn expect_ok(res: reqwest::Response) -> Result<reqwest::Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(SwarmError::TrackerUnavailable(format!(
        "tracker answered {status}: {body}"
    )))
}

fn unavailable(e: reqwest::Error) -> SwarmError {
    SwarmError::TrackerUnavailable(e.to_string())
}
