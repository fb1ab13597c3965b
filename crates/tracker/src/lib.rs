use axum::{
    routing::{get, post},
    Json, Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

pub mod db;
pub mod error;
pub mod handlers;

pub use db::TrackerDb;
pub use error::TrackerError;

pub const DEFAULT_ACTIVE_WINDOW: Duration = Duration::from_secs(300);

pub struct AppState {
    pub db: RwLock<TrackerDb>,
    /// JSON snapshot rewritten after every accepted announce.
    pub db_path: Option<PathBuf>,
    pub active_window: Duration,
}

impl AppState {
    pub fn new(db: TrackerDb, db_path: Option<PathBuf>, active_window: Duration) -> Self {
        Self {
            db: RwLock::new(db),
            db_path,
            active_window,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(TrackerDb::default(), None, DEFAULT_ACTIVE_WINDOW)
    }

    pub(crate) fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub(crate) fn active_window_ms(&self) -> i64 {
        i64::try_from(self.active_window.as_millis()).unwrap_or(i64::MAX)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/readyz", get(health_check))
        .route("/generate_file_id", post(handlers::generate_file_id))
        .route("/announce", post(handlers::announce))
        .route("/list", get(handlers::list_files))
        .route("/file/:file_id", get(handlers::file_info))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "swarm-tracker",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
