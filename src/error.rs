//! Crate-wide error kinds (spec.md §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Business and infrastructure error kinds shared by every component.
///
/// Business errors (`InvalidArgument` / `Forbidden` / `NotFound` / `Conflict`)
/// are never retried and always surfaced. Infrastructure errors (`Transient`,
/// `Timeout`, `BusDeadLetter`) are retried with capped attempts at the call
/// site; if still failing they are turned into a user-visible error rather
/// than a silent drop.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("moved to dead-letter after exhausting retries: {0}")]
    BusDeadLetter(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl AppError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Transient(_) | AppError::Timeout(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Transient(_) | AppError::BusDeadLetter(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Stable machine-readable kind name, used on both the REST surface and
    /// the hub-method error payloads sent over the duplex transport.
    pub fn kind_name(&self) -> &'static str {
        match self {
            AppError::InvalidArgument(_) => "InvalidArgument",
            AppError::Unauthenticated => "Unauthenticated",
            AppError::Forbidden => "Forbidden",
            AppError::NotFound(_) => "NotFound",
            AppError::Conflict(_) => "Conflict",
            AppError::Transient(_) => "Transient",
            AppError::BusDeadLetter(_) => "BusDeadLetter",
            AppError::Timeout(_) => "Timeout",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(kind = self.kind_name(), error = %self, "request failed");
        let body = Json(json!({
            "error": self.kind_name(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => AppError::NotFound("row".to_string()),
            other => AppError::Transient(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
