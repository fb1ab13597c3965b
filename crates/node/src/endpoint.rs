use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::future::Future;
use std::sync::Arc;
use swarm_protocol::{ChunkQuery, ErrorBody};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::context::{PeerContext, PeerStatus};
use crate::error::SwarmError;
use crate::store::ChunkStore;

#[derive(Debug, Error)]
enum EndpointError {
    #[error("{0}")]
    BadRequest(String),
    #[error("file not found")]
    FileNotFound,
    #[error("chunk not found")]
    ChunkNotFound,
    #[error("internal error")]
    Internal,
}

impl IntoResponse for EndpointError {
    fn into_response(self) -> Response {
        let status = match self {
            EndpointError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EndpointError::FileNotFound | EndpointError::ChunkNotFound => StatusCode::NOT_FOUND,
            EndpointError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

/// Chunk serving routes backed by the local store.
pub fn router(store: Arc<ChunkStore>) -> Router {
    Router::new()
        .route("/readyz", get(health_check))
        .route("/chunk", get(get_chunk))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

pub fn status_router(ctx: Arc<PeerContext>) -> Router {
    Router::new()
        .route("/status", get(status))
        .with_state(ctx)
}

/// Serves `app` on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "swarm-node",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn get_chunk(
    State(store): State<Arc<ChunkStore>>,
    query: Result<Query<ChunkQuery>, QueryRejection>,
) -> Result<Response, EndpointError> {
    let Query(q) = query.map_err(|e| EndpointError::BadRequest(e.body_text()))?;

    // Unregistered files get the same answer whether or not we know of them.
    match store.manifest(&q.file_id) {
        Ok(Some(_)) => {}
        Ok(None) => return Err(EndpointError::FileNotFound),
        Err(e) => {
            error!(file_id = %q.file_id, "Manifest lookup failed: {e}");
            return Err(EndpointError::Internal);
        }
    }

    match store.get(&q.file_id, q.chunk_index) {
        Ok(bytes) => {
            debug!(file_id = %q.file_id, chunk = q.chunk_index, len = bytes.len(), "Serving chunk");
            Ok((
                [(header::CONTENT_TYPE, "application/octet-stream")],
                bytes,
            )
                .into_response())
        }
        Err(SwarmError::NotFound { .. }) => Err(EndpointError::ChunkNotFound),
        Err(e) => {
            error!(file_id = %q.file_id, chunk = q.chunk_index, "Chunk read failed: {e}");
            Err(EndpointError::Internal)
        }
    }
}

async fn status(State(ctx): State<Arc<PeerContext>>) -> Json<PeerStatus> {
    Json(ctx.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use swarm_manifest::split;
    use tower::ServiceExt;

    fn seeded_store() -> (Arc<ChunkStore>, Vec<u8>) {
        let store = ChunkStore::temporary().unwrap();
        let data: Vec<u8> = (0..250u8).collect();
        let manifest = split("f1", "a.bin", &data, 100).unwrap();
        store.register_manifest(&manifest).unwrap();
        store.put("f1", 0, &data[..100]).unwrap();
        store.put("f1", 2, &data[200..]).unwrap();
        (Arc::new(store), data)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let res = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let content_type = res
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, content_type, body.to_vec())
    }

    #[tokio::test]
    async fn serves_exact_stored_bytes() {
        let (store, data) = seeded_store();
        let (status, ct, body) = get(router(store), "/chunk?file_id=f1&chunk_index=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ct.as_deref(), Some("application/octet-stream"));
        assert_eq!(body, &data[200..]);
    }

    #[tokio::test]
    async fn missing_chunk_is_404() {
        let (store, _) = seeded_store();
        let (status, _, body) = get(router(store), "/chunk?file_id=f1&chunk_index=1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error, "chunk not found");
    }

    #[tokio::test]
    async fn unregistered_file_is_404_without_detail() {
        let (store, _) = seeded_store();
        let (status, _, body) = get(router(store), "/chunk?file_id=nope&chunk_index=0").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error, "file not found");
    }

    #[tokio::test]
    async fn malformed_query_is_400() {
        let (store, _) = seeded_store();
        let (status, _, _) = get(router(store), "/chunk?file_id=f1&chunk_index=x").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
