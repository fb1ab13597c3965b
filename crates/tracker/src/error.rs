use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use swarm_protocol::ErrorBody;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("{0}")]
    BadRequest(String),
    #[error("File not found")]
    FileNotFound,
}

impl IntoResponse for TrackerError {
    fn into_response(self) -> Response {
        let status = match self {
            TrackerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            TrackerError::FileNotFound => StatusCode::NOT_FOUND,
        };
        (status, Json(ErrorBody::new(self.to_string()))).into_response()
    }
}
