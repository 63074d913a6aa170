use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use peerdrop_shared::ProtocolError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Failures of hub operations. `RoomNotFound` is shown to users verbatim.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("room not found")]
    RoomNotFound(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
