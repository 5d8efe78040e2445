use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Typed error surface shared by every subsystem boundary (store, probe, oracle,
/// read API). Mirrors the shape of this codebase's `LLMError`: a flat enum with
/// `#[from]` conversions plus an explicit retry classification, rather than a
/// single opaque `anyhow::Error` once a value crosses a module boundary that a
/// caller needs to branch on.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("probe error: {0}")]
    Probe(#[from] crate::probes::ProbeError),

    #[error("oracle error: {0}")]
    Oracle(#[from] crate::analyzer::oracle::OracleError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the operation that produced this error is worth retrying with
    /// backoff, as opposed to surfacing a permanent failure (auth, schema
    /// missing, malformed input).
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Store(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            AppError::Probe(e) => e.is_retryable(),
            AppError::Oracle(e) => e.is_retryable(),
            AppError::NotFound(_) | AppError::Validation(_) | AppError::Config(_) => false,
            AppError::Internal(_) => false,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Store(_) | AppError::Probe(_) | AppError::Oracle(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            },
            AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
