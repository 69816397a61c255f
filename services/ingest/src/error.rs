//! API error envelope and status mapping.

use crate::multipart::MultipartError;
use crate::validation::{FieldError, PhotoIssue, PhotoProblem, PhotoValidationError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bodyscan_common::{Pose, TransitionError};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

/// Failures of the photo or session backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("object storage error: {0}")]
    ObjectStorage(String),

    #[error("corrupt session document: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl StoreError {
    pub fn object_storage(err: impl std::fmt::Display) -> Self {
        StoreError::ObjectStorage(err.to_string())
    }
}

/// Client-facing error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InvalidArgument,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    FailedPrecondition,
    Unavailable,
    Internal,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error returned by every API handler, rendered as `{ok: false, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub code: ErrorCode,
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<Pose>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invalid: Vec<PhotoIssue>,
    pub debug_id: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            message: message.into(),
            missing: Vec::new(),
            invalid: Vec::new(),
            debug_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, reason, message)
    }

    pub fn unauthenticated() -> Self {
        Self::new(
            ErrorCode::Unauthenticated,
            "missing_identity",
            "Sign in before uploading a scan",
        )
    }

    pub fn not_found(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, reason, message)
    }

    pub fn with_debug_id(mut self, debug_id: impl Into<String>) -> Self {
        self.debug_id = debug_id.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    ok: bool,
    #[serde(flatten)]
    error: &'a ApiError,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = ?self.code, reason = %self.reason, debug_id = %self.debug_id, message = %self.message, "Request failed");
        } else {
            warn!(code = ?self.code, reason = %self.reason, debug_id = %self.debug_id, message = %self.message, "Request rejected");
        }
        metrics::counter!("ingest.requests.failed", "code" => self.reason.clone()).increment(1);

        let body = Json(ErrorEnvelope {
            ok: false,
            error: &self,
        });
        (status, body).into_response()
    }
}

impl From<PhotoValidationError> for ApiError {
    fn from(err: PhotoValidationError) -> Self {
        let mut api = ApiError::invalid_argument(err.reason(), err.to_string());
        api.missing = err.missing;
        api.invalid = err.invalid;
        api
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        let message = err.to_string();
        match err {
            MultipartError::FieldTooLarge { field } => match field.parse::<Pose>() {
                Ok(pose) => {
                    let mut api = ApiError::invalid_argument("invalid_photo", message);
                    api.invalid = vec![PhotoIssue::new(pose.as_str(), PhotoProblem::TooLarge)];
                    api
                }
                Err(_) => ApiError::invalid_argument("field_too_large", message),
            },
            MultipartError::BodyTooLarge => ApiError::invalid_argument("body_too_large", message),
            _ => ApiError::invalid_argument("malformed_multipart", message),
        }
    }
}

impl From<FieldError> for ApiError {
    fn from(err: FieldError) -> Self {
        ApiError::invalid_argument("invalid_field", err.to_string())
    }
}

impl From<TransitionError> for ApiError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::IncompletePoses { ref missing, .. } => {
                let mut api = ApiError::new(ErrorCode::FailedPrecondition, "missing_photo", err.to_string());
                api.missing = missing.clone();
                api
            }
            _ => ApiError::new(ErrorCode::FailedPrecondition, "invalid_transition", err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transition(transition) => transition.into(),
            StoreError::Corrupt(e) => ApiError::new(ErrorCode::Internal, "corrupt_session", e.to_string()),
            other => ApiError::new(ErrorCode::Unavailable, "storage_unavailable", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bodyscan_common::ScanStatus;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::InvalidArgument.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::PermissionDenied.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::FailedPrecondition.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(ErrorCode::Unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::Internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_envelope_shape() {
        let err = ApiError::from(PhotoValidationError::missing(vec![Pose::Left])).with_debug_id("dbg-1");
        let json = serde_json::to_value(ErrorEnvelope { ok: false, error: &err }).unwrap();

        assert_eq!(json["ok"], false);
        assert_eq!(json["code"], "invalid-argument");
        assert_eq!(json["reason"], "missing_photo");
        assert_eq!(json["missing"], serde_json::json!(["left"]));
        assert_eq!(json["debugId"], "dbg-1");
        assert!(json.get("invalid").is_none());
    }

    #[test]
    fn test_oversized_pose_part_is_attributed() {
        let err = ApiError::from(MultipartError::FieldTooLarge {
            field: "back".to_string(),
        });
        assert_eq!(err.reason, "invalid_photo");
        assert_eq!(err.invalid, vec![PhotoIssue::new("back", PhotoProblem::TooLarge)]);
    }

    #[test]
    fn test_store_errors() {
        let err = ApiError::from(StoreError::ObjectStorage("timeout".to_string()));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        let err = ApiError::from(StoreError::Transition(TransitionError::Illegal {
            scan_id: "s1".to_string(),
            from: ScanStatus::Complete,
            to: ScanStatus::Queued,
        }));
        assert_eq!(err.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(err.reason, "invalid_transition");
    }
}
