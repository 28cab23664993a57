use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced to HTTP callers. Everything else in the pipeline is
/// logged and absorbed before it can reach this type.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("{0}")]
    BadRequest(String),

    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(err) => {
                tracing::error!(error = %err, "profile store request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &self {
            ApiError::Store(_) => "storage unavailable".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("memory service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("memory service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid memory service url '{0}'")]
    InvalidUrl(String),

    #[error("refusing path segment '{0}'")]
    InvalidPathSegment(String),
}

/// Rejections at the webhook payload boundary, after authentication.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown event kind '{0}'")]
    UnknownEvent(String),

    #[error("missing field '{0}'")]
    MissingField(&'static str),
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("database is required outside development mode (set DATABASE_URL)")]
    DatabaseRequired,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("memory service client: {0}")]
    MemoryClient(#[from] SyncError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("server runtime failure: {0}")]
    Serve(std::io::Error),
}
