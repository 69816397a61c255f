//! Client for the ingest HTTP API.

use bodyscan_common::Pose;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::ApiClientConfig;
use crate::upload::TransportError;

/// Header carrying the caller identity.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

#[derive(Debug, Error)]
pub enum ApiClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
}

impl ApiClientError {
    /// Server-side and network hiccups are worth retrying; client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiClientError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            ApiClientError::Api { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
        }
    }
}

impl From<ApiClientError> for TransportError {
    fn from(err: ApiClientError) -> Self {
        let retryable = err.is_retryable();
        let code = match &err {
            ApiClientError::Http(e) if e.is_timeout() => "http_timeout".to_string(),
            ApiClientError::Http(_) => "network_error".to_string(),
            ApiClientError::Api { status, .. } => format!("http_{status}"),
        };
        TransportError::new(code, err.to_string(), retryable)
    }
}

/// Presigned PUT target for one photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub path: String,
    pub url: String,
    pub storage_path: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadUrlResponse {
    url: String,
}

/// Body of `POST /api/scans/:scan_id/complete`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteScanRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_weight_kg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_weight_kg: Option<f64>,
}

/// Successful ingest response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReceipt {
    pub scan_id: String,
    pub debug_id: String,
    pub correlation_id: String,
    pub status: String,
    pub photo_paths: BTreeMap<Pose, String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

pub struct ScanApiClient {
    client: Client,
    base_url: String,
}

impl ScanApiClient {
    pub fn new(config: &ApiClientConfig) -> Result<Self, ApiClientError> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// The underlying HTTP client, shared with photo transfers.
    pub fn http(&self) -> &Client {
        &self.client
    }

    pub fn photo_url(&self, scan_id: &str, pose: Pose, action: &str) -> String {
        format!("{}/api/scans/{}/photos/{}/{}", self.base_url, scan_id, pose, action)
    }

    #[instrument(skip(self))]
    pub async fn upload_target(
        &self,
        uid: &str,
        scan_id: &str,
        pose: Pose,
    ) -> Result<UploadTarget, ApiClientError> {
        let response = self
            .client
            .post(self.photo_url(scan_id, pose, "upload-url"))
            .header(USER_ID_HEADER, uid)
            .send()
            .await?;

        let target: UploadTarget = check(response).await?.json().await?;
        debug!(path = %target.path, expires_at = %target.expires_at, "Obtained upload target");
        Ok(target)
    }

    #[instrument(skip(self))]
    pub async fn download_url(
        &self,
        uid: &str,
        scan_id: &str,
        pose: Pose,
    ) -> Result<String, ApiClientError> {
        let response = self
            .client
            .get(self.photo_url(scan_id, pose, "url"))
            .header(USER_ID_HEADER, uid)
            .send()
            .await?;

        let body: DownloadUrlResponse = check(response).await?.json().await?;
        Ok(body.url)
    }

    /// Tell the server every photo is in storage and the scan can be queued.
    #[instrument(skip(self, request))]
    pub async fn complete_scan(
        &self,
        uid: &str,
        scan_id: &str,
        correlation_id: &str,
        request: &CompleteScanRequest,
    ) -> Result<ScanReceipt, ApiClientError> {
        let response = self
            .client
            .post(format!("{}/api/scans/{}/complete", self.base_url, scan_id))
            .header(USER_ID_HEADER, uid)
            .header(CORRELATION_ID_HEADER, correlation_id)
            .json(request)
            .send()
            .await?;

        Ok(check(response).await?.json().await?)
    }
}

/// Turn a non-success response into an [`ApiClientError::Api`].
pub(crate) async fn check(response: Response) -> Result<Response, ApiClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    Err(api_error(status, &text))
}

fn api_error(status: StatusCode, body: &str) -> ApiClientError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let (code, message) = match parsed {
        Some(ErrorBody { code, message }) if !code.is_empty() => (code, message),
        _ => (
            status.canonical_reason().unwrap_or("error").to_lowercase(),
            body.chars().take(200).collect(),
        ),
    };

    ApiClientError::Api {
        status: status.as_u16(),
        code,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ScanApiClient {
        ScanApiClient::new(&ApiClientConfig {
            base_url: "http://ingest.local/".to_string(),
            ..ApiClientConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_photo_url() {
        assert_eq!(
            client().photo_url("scan-1", Pose::Left, "upload-url"),
            "http://ingest.local/api/scans/scan-1/photos/left/upload-url"
        );
    }

    #[test]
    fn test_api_error_uses_json_envelope() {
        let err = api_error(
            StatusCode::PRECONDITION_FAILED,
            r#"{"ok":false,"code":"failed-precondition","message":"photos missing"}"#,
        );
        match err {
            ApiClientError::Api { status, code, message } => {
                assert_eq!(status, 412);
                assert_eq!(code, "failed-precondition");
                assert_eq!(message, "photos missing");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_api_error_without_envelope() {
        let err = api_error(StatusCode::SERVICE_UNAVAILABLE, "upstream down");
        assert!(err.is_retryable());
        let transport: TransportError = err.into();
        assert_eq!(transport.code, "http_503");
        assert!(transport.retryable);
    }

    #[test]
    fn test_client_errors_not_retryable() {
        let err = api_error(StatusCode::FORBIDDEN, "");
        assert!(!err.is_retryable());
        assert!(!TransportError::from(err).retryable);
    }

    #[test]
    fn test_receipt_deserializes() {
        let receipt: ScanReceipt = serde_json::from_str(
            r#"{"ok":true,"scanId":"s1","debugId":"d1","correlationId":"c1","status":"queued",
                "photoPaths":{"front":"a","back":"b","left":"c","right":"d"}}"#,
        )
        .unwrap();
        assert_eq!(receipt.photo_paths.len(), 4);
        assert_eq!(receipt.photo_paths[&Pose::Front], "a");
    }
}
