use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use latchflow_bundles::DownloadError;
use latchflow_core::codes;
use latchflow_store::StoreError;

/// Error surfaced by an HTTP handler: an HTTP status, a stable code, and a
/// human-readable message, rendered as
/// `{"status":"error","code":...,"message":...}`.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ServerError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    /// Optional `Retry-After` seconds for 429 responses.
    pub retry_after: Option<u64>,
}

impl ServerError {
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, codes::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, codes::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message)
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn rate_limited(retry_after: u64) -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            codes::RATE_LIMITED,
            "too many requests",
        );
        err.retry_after = Some(retry_after);
        err
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            message,
        )
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_IMPLEMENTED, codes::NOT_IMPLEMENTED, message)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": "error",
            "code": self.code,
            "message": self.message,
        });
        let mut response = (self.status, Json(body)).into_response();
        if let Some(retry) = self.retry_after {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }
        response
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound { .. } | StoreError::VersionNotFound { .. } => {
                Self::not_found(err.to_string())
            }
            StoreError::Conflict(_) => Self::conflict(codes::CONFLICT, err.to_string()),
            StoreError::InUse { .. } => Self::conflict(codes::IN_USE, err.to_string()),
            StoreError::Consumed(_) => {
                Self::new(StatusCode::GONE, codes::EXPIRED, err.to_string())
            }
            StoreError::Expired(_) => {
                Self::new(StatusCode::GONE, codes::EXPIRED, err.to_string())
            }
            StoreError::ChainTooDeep { .. } | StoreError::Backend(_) => {
                Self::internal(err.to_string())
            }
        }
    }
}

impl From<DownloadError> for ServerError {
    fn from(err: DownloadError) -> Self {
        match &err {
            DownloadError::Forbidden => Self::forbidden("assignment does not grant access"),
            DownloadError::QuotaExceeded { .. } => Self::new(
                StatusCode::FORBIDDEN,
                codes::MAX_DOWNLOADS_EXCEEDED,
                err.to_string(),
            ),
            DownloadError::CooldownActive { retry_after_secs } => {
                let mut e = Self::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    codes::COOLDOWN_ACTIVE,
                    err.to_string(),
                );
                e.retry_after = Some(*retry_after_secs);
                e
            }
            DownloadError::BundleUnavailable => Self::not_found("bundle unavailable"),
            DownloadError::NoStoragePath => {
                Self::conflict(codes::NO_STORAGE_PATH, "bundle has no built archive")
            }
            DownloadError::Store(inner) => Self::from_store_ref(inner),
            DownloadError::Storage(inner) => Self::internal(inner.to_string()),
        }
    }
}

impl ServerError {
    fn from_store_ref(err: &StoreError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<latchflow_storage::StorageError> for ServerError {
    fn from(err: latchflow_storage::StorageError) -> Self {
        match &err {
            latchflow_storage::StorageError::NotFound(_) => Self::not_found(err.to_string()),
            latchflow_storage::StorageError::NotSupported(_) => {
                Self::not_implemented(err.to_string())
            }
            _ => Self::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_in_use_maps_to_409_in_use() {
        let err: ServerError = StoreError::InUse {
            entity: "bundle",
            id: "b-1".into(),
            dependents: "objects",
        }
        .into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, codes::IN_USE);
    }

    #[test]
    fn cooldown_maps_to_429_with_retry_after() {
        let err: ServerError = DownloadError::CooldownActive {
            retry_after_secs: 30,
        }
        .into();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code, codes::COOLDOWN_ACTIVE);
        assert_eq!(err.retry_after, Some(30));
    }

    #[test]
    fn presign_gap_maps_to_501() {
        let err: ServerError = latchflow_storage::StorageError::NotSupported("signed put").into();
        assert_eq!(err.status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(err.code, codes::NOT_IMPLEMENTED);
    }
}
