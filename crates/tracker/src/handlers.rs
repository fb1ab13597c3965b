use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, State},
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;
use swarm_protocol::{
    AnnounceRequest, AnnounceResponse, FileInfoResponse, GenerateFileIdRequest,
    GenerateFileIdResponse, ListResponse,
};
use tracing::{debug, info, warn};

use crate::db::generate_file_id as derive_file_id;
use crate::error::TrackerError;
use crate::AppState;

pub async fn generate_file_id(
    payload: Result<Json<GenerateFileIdRequest>, JsonRejection>,
) -> Result<Json<GenerateFileIdResponse>, TrackerError> {
    let Json(req) = payload.map_err(|_| TrackerError::BadRequest("Missing required fields".into()))?;
    if req.filename.is_empty() || req.size == 0 {
        return Err(TrackerError::BadRequest("Missing required fields".into()));
    }
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| chrono::Utc::now().timestamp_micros());
    let file_id = derive_file_id(&req.filename, req.size, nanos);
    info!(%file_id, filename = %req.filename, size = req.size, "Issued file id");
    Ok(Json(GenerateFileIdResponse { file_id }))
}

pub async fn announce(
    State(state): State<Arc<AppState>>,
    remote: Option<ConnectInfo<SocketAddr>>,
    payload: Result<Json<AnnounceRequest>, JsonRejection>,
) -> Result<Json<AnnounceResponse>, TrackerError> {
    let Json(req) = payload.map_err(|_| TrackerError::BadRequest("Missing required fields".into()))?;
    let observed_host = remote
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let (peer_id, file_id, held) = (req.peer_id.clone(), req.file_id.clone(), req.chunks.len());

    let mut db = state.db.write().await;
    db.announce(req, observed_host, state.now_ms())?;
    debug!(%peer_id, %file_id, held, "Announce accepted");

    if let Some(path) = &state.db_path {
        match db.to_json() {
            Ok(raw) => {
                if let Err(e) = tokio::fs::write(path, raw).await {
                    warn!(path = %path.display(), "Failed to persist tracker db: {e}");
                }
            }
            Err(e) => warn!("Failed to serialize tracker db: {e}"),
        }
    }

    Ok(Json(AnnounceResponse { ok: true }))
}

pub async fn list_files(State(state): State<Arc<AppState>>) -> Json<ListResponse> {
    let db = state.db.read().await;
    Json(db.list(state.now_ms(), state.active_window_ms()))
}

pub async fn file_info(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
) -> Result<Json<FileInfoResponse>, TrackerError> {
    let db = state.db.read().await;
    db.file_info(&file_id, state.now_ms(), state.active_window_ms())
        .map(Json)
        .ok_or(TrackerError::FileNotFound)
}
