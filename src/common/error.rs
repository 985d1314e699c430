//! Error types for geodispatch

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Request Errors ===
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // === Store Errors ===
    #[error("Store unavailable ({store}): {reason}")]
    StoreUnavailable { store: &'static str, reason: String },

    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn unavailable(store: &'static str, reason: impl Into<String>) -> Self {
        Error::StoreUnavailable {
            store,
            reason: reason.into(),
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable { .. })
    }

    /// Re-tag a backend failure as an outage of `store`.
    ///
    /// Request errors pass through untouched so callers still see
    /// `Validation` / `NotFound`.
    pub fn into_store_failure(self, store: &'static str) -> Self {
        match self {
            Error::Validation(_) | Error::NotFound(_) | Error::StoreUnavailable { .. } => self,
            other => Error::StoreUnavailable {
                store,
                reason: other.to_string(),
            },
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        let message = if status.is_server_error() {
            tracing::error!("request failed: {}", self);
            match &self {
                Error::StoreUnavailable { store, .. } => format!("{} unavailable", store),
                _ => "INTERNAL SERVER ERROR".to_string(),
            }
        } else {
            self.to_string()
        };
        (status, axum::Json(json!({ "message": message }))).into_response()
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Corrupted(format!("Serialize error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::unavailable("history", "timed out").is_retryable());
        assert!(!Error::validation("bad lat").is_retryable());
        assert!(!Error::NotFound("driver 1".into()).is_retryable());
    }

    #[test]
    fn test_into_store_failure() {
        let err = Error::Corrupted("bad record".into()).into_store_failure("history");
        assert!(matches!(err, Error::StoreUnavailable { store: "history", .. }));

        let err = Error::NotFound("driver 7".into()).into_store_failure("state");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            Error::validation("x").to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::NotFound("x".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::unavailable("geo", "down").to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::Internal("x".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
