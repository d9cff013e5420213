//! Domain error taxonomy.
//!
//! Every fallible core operation returns `Result<T, EngineError>`. Each
//! variant maps to exactly one HTTP status code so the axum handlers in
//! `main.rs` never have to re-derive the status from the error message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("insufficient available funds: {0}")]
    InsufficientFunds(String),

    #[error("insufficient locked funds: {0}")]
    InsufficientLocked(String),

    #[error("duplicate vote: {0}")]
    DuplicateVote(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Optimistic-lock failure on a concurrent update. Retried internally
    /// (up to 3 times with jitter, see `retry::with_retry`); only surfaces
    /// once the retry budget is exhausted.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    StoreError(#[from] anyhow::Error),
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
            EngineError::InvalidState(_) => StatusCode::BAD_REQUEST,
            EngineError::InsufficientFunds(_) => StatusCode::BAD_REQUEST,
            EngineError::InsufficientLocked(_) => StatusCode::BAD_REQUEST,
            EngineError::DuplicateVote(_) => StatusCode::BAD_REQUEST,
            EngineError::RateLimited(_) => StatusCode::BAD_REQUEST,
            EngineError::Conflict(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::StoreError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::StoreError(anyhow::Error::new(e))
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
