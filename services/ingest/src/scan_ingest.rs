//! Scan submission workflows.
//!
//! Two ways to get four photos into a queued session:
//!
//! 1. Multipart: the client posts all photos in one request ([`ScanIngestor::ingest`]).
//! 2. Direct upload: the client asks for a presigned PUT per pose
//!    ([`ScanIngestor::upload_target`]), uploads each photo itself and then
//!    calls [`ScanIngestor::complete`].

use crate::error::{ApiError, ErrorCode, StoreError};
use crate::multipart::ParsedForm;
use crate::photo_store::{PhotoStore, PresignedUrl};
use crate::session_store::SessionStore;
use crate::validation::{
    validate_pose_parts, validate_scan_id, PhotoConstraints, PhotoValidationError, ScanFields,
};
use bodyscan_common::{
    build_scan_photo_path, Pose, ScanStatus, ScanUploadSession, SessionUpdate, PHOTO_CONTENT_TYPE,
};
use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Who is calling and how to refer to this request in logs.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub uid: String,
    pub debug_id: String,
    /// Value of the `x-correlation-id` header
    pub correlation_id: Option<String>,
}

impl RequestContext {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            debug_id: Uuid::new_v4().to_string(),
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    fn correlation_or_new(&self) -> String {
        self.correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

/// Success envelope for submissions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReceipt {
    pub ok: bool,
    pub scan_id: String,
    pub debug_id: String,
    pub correlation_id: String,
    pub status: ScanStatus,
    pub photo_paths: BTreeMap<Pose, String>,
}

impl ScanReceipt {
    fn new(session: ScanUploadSession, ctx: &RequestContext, correlation_id: String) -> Self {
        Self {
            ok: true,
            scan_id: session.scan_id,
            debug_id: ctx.debug_id.clone(),
            correlation_id,
            status: session.status,
            photo_paths: session.photo_paths,
        }
    }
}

/// Presigned PUT for one pose photo.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub path: String,
    pub url: String,
    pub storage_path: String,
    pub expires_at: DateTime<Utc>,
}

/// Body of the completion call.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteScanRequest {
    #[serde(default, alias = "currentWeight")]
    pub current_weight_kg: Option<f64>,
    #[serde(default, alias = "goalWeight")]
    pub goal_weight_kg: Option<f64>,
}

pub struct ScanIngestor {
    photos: Arc<dyn PhotoStore>,
    sessions: Arc<dyn SessionStore>,
    presign_expiry: Duration,
}

impl ScanIngestor {
    pub fn new(photos: Arc<dyn PhotoStore>, sessions: Arc<dyn SessionStore>, presign_expiry: Duration) -> Self {
        Self {
            photos,
            sessions,
            presign_expiry,
        }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Validate a multipart submission, store its photos and queue the scan.
    #[instrument(skip(self, ctx, form, constraints), fields(uid = %ctx.uid, debug_id = %ctx.debug_id))]
    pub async fn ingest(
        &self,
        ctx: &RequestContext,
        form: ParsedForm,
        constraints: &PhotoConstraints,
    ) -> Result<ScanReceipt, ApiError> {
        let fields = ScanFields::from_form(&form, ctx.correlation_id.as_deref())?;
        let photos = validate_pose_parts(form.files, constraints)?;

        self.ensure_accepts_photos(&ctx.uid, &fields.scan_id).await?;

        let total_bytes = photos.total_bytes();
        let stored = try_join_all(photos.into_iter().map(|(pose, file)| {
            let path = build_scan_photo_path(&ctx.uid, &fields.scan_id, pose);
            async move {
                self.photos
                    .put_photo(&path, file.bytes, PHOTO_CONTENT_TYPE)
                    .await
                    .map(|_| (pose, path))
            }
        }))
        .await?;

        let update = stored
            .into_iter()
            .fold(SessionUpdate::new(&ctx.uid, &fields.scan_id), |update, (pose, path)| {
                update.with_photo_path(pose, path)
            })
            .with_status(ScanStatus::Queued)
            .with_correlation_id(&fields.correlation_id)
            .with_weights(fields.current_weight_kg, fields.goal_weight_kg);

        // The status check above is not held across the writes; a scan locked
        // in between is rejected here with its objects already replaced.
        let session = self.sessions.upsert(update).await.map_err(|e| {
            warn!(
                scan_id = %fields.scan_id,
                error = %e,
                "Photos stored but session update failed"
            );
            metrics::counter!("ingest.scans.orphaned").increment(1);
            e
        })?;

        info!(
            scan_id = %session.scan_id,
            correlation_id = %fields.correlation_id,
            total_bytes,
            "Scan queued from multipart submission"
        );
        metrics::counter!("ingest.scans.queued", "source" => "multipart").increment(1);
        metrics::histogram!("ingest.scan.bytes").record(total_bytes as f64);

        Ok(ScanReceipt::new(session, ctx, fields.correlation_id))
    }

    /// Hand out a presigned PUT for one pose and make sure the session exists.
    #[instrument(skip(self, ctx), fields(uid = %ctx.uid, debug_id = %ctx.debug_id))]
    pub async fn upload_target(
        &self,
        ctx: &RequestContext,
        scan_id: &str,
        pose: Pose,
    ) -> Result<UploadTarget, ApiError> {
        let scan_id = validate_scan_id(scan_id)?;
        let existing = self.ensure_accepts_photos(&ctx.uid, scan_id).await?;

        let mut update = SessionUpdate::new(&ctx.uid, scan_id);
        if existing == Some(ScanStatus::Error) {
            update = update.with_status(ScanStatus::Uploading);
        }
        if let Some(correlation_id) = &ctx.correlation_id {
            update = update.with_correlation_id(correlation_id);
        }
        self.sessions.upsert(update).await?;

        let path = build_scan_photo_path(&ctx.uid, scan_id, pose);
        let presigned = self
            .photos
            .presign_upload(&path, PHOTO_CONTENT_TYPE, self.presign_expiry)
            .await?;

        metrics::counter!("ingest.upload_targets.issued").increment(1);

        Ok(UploadTarget {
            storage_path: self.photos.storage_uri(&path),
            path,
            url: presigned.url,
            expires_at: presigned.expires_at,
        })
    }

    /// Presigned GET for a stored pose photo.
    pub async fn download_url(
        &self,
        ctx: &RequestContext,
        scan_id: &str,
        pose: Pose,
    ) -> Result<PresignedUrl, ApiError> {
        let scan_id = validate_scan_id(scan_id)?;
        let path = build_scan_photo_path(&ctx.uid, scan_id, pose);

        if !self.photos.photo_exists(&path).await? {
            return Err(ApiError::not_found(
                "photo_not_found",
                format!("No {pose} photo stored for scan {scan_id}"),
            ));
        }

        Ok(self.photos.presign_download(&path, self.presign_expiry).await?)
    }

    /// Confirm all four directly uploaded photos exist and queue the scan.
    #[instrument(skip(self, ctx, request), fields(uid = %ctx.uid, debug_id = %ctx.debug_id))]
    pub async fn complete(
        &self,
        ctx: &RequestContext,
        scan_id: &str,
        request: CompleteScanRequest,
    ) -> Result<ScanReceipt, ApiError> {
        let scan_id = validate_scan_id(scan_id)?;
        self.ensure_accepts_photos(&ctx.uid, scan_id).await?;

        let paths: Vec<(Pose, String)> = Pose::ALL
            .into_iter()
            .map(|pose| (pose, build_scan_photo_path(&ctx.uid, scan_id, pose)))
            .collect();

        let exists = join_all(paths.iter().map(|(_, path)| self.photos.photo_exists(path)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, StoreError>>()?;

        let missing: Vec<Pose> = paths
            .iter()
            .zip(&exists)
            .filter(|(_, exists)| !**exists)
            .map(|((pose, _), _)| *pose)
            .collect();
        if !missing.is_empty() {
            return Err(PhotoValidationError::missing(missing).into());
        }

        let correlation_id = ctx.correlation_or_new();
        let update = paths
            .into_iter()
            .fold(SessionUpdate::new(&ctx.uid, scan_id), |update, (pose, path)| {
                update.with_photo_path(pose, path)
            })
            .with_status(ScanStatus::Queued)
            .with_correlation_id(&correlation_id)
            .with_weights(request.current_weight_kg, request.goal_weight_kg);

        let session = self.sessions.upsert(update).await?;

        info!(scan_id = %session.scan_id, correlation_id = %correlation_id, "Scan queued after direct upload");
        metrics::counter!("ingest.scans.queued", "source" => "direct").increment(1);

        Ok(ScanReceipt::new(session, ctx, correlation_id))
    }

    pub async fn session(&self, ctx: &RequestContext, scan_id: &str) -> Result<ScanUploadSession, ApiError> {
        let scan_id = validate_scan_id(scan_id)?;
        self.sessions
            .get(&ctx.uid, scan_id)
            .await?
            .ok_or_else(|| ApiError::not_found("scan_not_found", format!("Scan {scan_id} does not exist")))
    }

    /// Reject writes to a scan that is already being analysed or done.
    async fn ensure_accepts_photos(&self, uid: &str, scan_id: &str) -> Result<Option<ScanStatus>, ApiError> {
        let status = self.sessions.get(uid, scan_id).await?.map(|session| session.status);

        match status {
            Some(status) if !status.accepts_photos() => Err(ApiError::new(
                ErrorCode::FailedPrecondition,
                "scan_locked",
                format!("Scan {scan_id} is {status} and no longer accepts photos"),
            )),
            _ => Ok(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multipart::UploadedFile;
    use crate::photo_store::MemoryPhotoStore;
    use crate::session_store::MemorySessionStore;
    use bytes::Bytes;

    struct Harness {
        photos: Arc<MemoryPhotoStore>,
        sessions: Arc<MemorySessionStore>,
        ingestor: ScanIngestor,
    }

    fn harness() -> Harness {
        let photos = Arc::new(MemoryPhotoStore::new("local"));
        let sessions = Arc::new(MemorySessionStore::new(Duration::from_secs(3600)));
        let ingestor = ScanIngestor::new(photos.clone(), sessions.clone(), Duration::from_secs(900));
        Harness {
            photos,
            sessions,
            ingestor,
        }
    }

    fn form(scan_id: &str, poses: &[&str]) -> ParsedForm {
        let mut form = ParsedForm::default();
        form.fields.insert("scanId".to_string(), scan_id.to_string());
        form.fields.insert("goalWeight".to_string(), "70".to_string());
        form.files = poses
            .iter()
            .map(|pose| UploadedFile {
                field: pose.to_string(),
                filename: format!("{pose}.jpg"),
                content_type: Some("image/jpeg".to_string()),
                bytes: Bytes::from(format!("jpeg-{pose}")),
            })
            .collect();
        form
    }

    const ALL: [&str; 4] = ["front", "back", "left", "right"];
    const LIMIT: PhotoConstraints = PhotoConstraints { max_bytes: 1024 };

    #[tokio::test]
    async fn test_ingest_stores_photos_and_queues() {
        let h = harness();
        let ctx = RequestContext::new("u1").with_correlation_id("corr-1");

        let receipt = h.ingestor.ingest(&ctx, form("s1", &ALL), &LIMIT).await.unwrap();

        assert!(receipt.ok);
        assert_eq!(receipt.status, ScanStatus::Queued);
        assert_eq!(receipt.correlation_id, "corr-1");
        assert_eq!(receipt.debug_id, ctx.debug_id);
        assert_eq!(receipt.photo_paths[&Pose::Left], "user_uploads/u1/scans/s1/left.jpg");
        assert_eq!(h.photos.len(), 4);

        let (bytes, content_type) = h.photos.get("user_uploads/u1/scans/s1/back.jpg").unwrap();
        assert_eq!(bytes, Bytes::from("jpeg-back"));
        assert_eq!(content_type, "image/jpeg");

        let session = h.sessions.get("u1", "s1").await.unwrap().unwrap();
        assert_eq!(session.goal_weight_kg, Some(70.0));
    }

    #[tokio::test]
    async fn test_ingest_missing_pose_stores_nothing() {
        let h = harness();
        let ctx = RequestContext::new("u1");

        let err = h
            .ingestor
            .ingest(&ctx, form("s1", &["front", "back", "right"]), &LIMIT)
            .await
            .unwrap_err();

        assert_eq!(err.reason, "missing_photo");
        assert_eq!(err.missing, vec![Pose::Left]);
        assert!(h.photos.is_empty());
        assert!(h.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_resubmission_keeps_created_at() {
        let h = harness();
        let ctx = RequestContext::new("u1");

        h.ingestor.ingest(&ctx, form("s1", &ALL), &LIMIT).await.unwrap();
        let first = h.sessions.get("u1", "s1").await.unwrap().unwrap();

        h.ingestor.ingest(&ctx, form("s1", &ALL), &LIMIT).await.unwrap();
        let second = h.sessions.get("u1", "s1").await.unwrap().unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn test_processing_scan_is_locked() {
        let h = harness();
        let ctx = RequestContext::new("u1");

        h.ingestor.ingest(&ctx, form("s1", &ALL), &LIMIT).await.unwrap();
        h.sessions
            .upsert(SessionUpdate::new("u1", "s1").with_status(ScanStatus::Processing))
            .await
            .unwrap();

        let err = h.ingestor.ingest(&ctx, form("s1", &ALL), &LIMIT).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::FailedPrecondition);
        assert_eq!(err.reason, "scan_locked");
    }

    #[tokio::test]
    async fn test_locked_scan_photos_not_replaced() {
        let h = harness();
        let ctx = RequestContext::new("u1");

        h.ingestor.ingest(&ctx, form("s1", &ALL), &LIMIT).await.unwrap();
        h.sessions
            .upsert(SessionUpdate::new("u1", "s1").with_status(ScanStatus::Processing))
            .await
            .unwrap();

        let mut retake = form("s1", &ALL);
        for file in &mut retake.files {
            file.bytes = Bytes::from_static(b"retake");
        }
        h.ingestor.ingest(&ctx, retake, &LIMIT).await.unwrap_err();

        for pose in ALL {
            let (bytes, _) = h
                .photos
                .get(&format!("user_uploads/u1/scans/s1/{pose}.jpg"))
                .unwrap();
            assert_eq!(bytes, Bytes::from(format!("jpeg-{pose}")));
        }
        assert_eq!(h.photos.len(), 4);
    }

    #[tokio::test]
    async fn test_direct_upload_flow() {
        let h = harness();
        let ctx = RequestContext::new("u1");

        let target = h.ingestor.upload_target(&ctx, "s2", Pose::Front).await.unwrap();
        assert_eq!(target.path, "user_uploads/u1/scans/s2/front.jpg");
        assert_eq!(target.storage_path, "memory://local/user_uploads/u1/scans/s2/front.jpg");
        assert_eq!(
            h.sessions.get("u1", "s2").await.unwrap().unwrap().status,
            ScanStatus::Uploading
        );

        for pose in [Pose::Front, Pose::Back, Pose::Right] {
            let path = build_scan_photo_path("u1", "s2", pose);
            h.photos.put_photo(&path, Bytes::from_static(b"jpeg"), "image/jpeg").await.unwrap();
        }

        let err = h
            .ingestor
            .complete(&ctx, "s2", CompleteScanRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason, "missing_photo");
        assert_eq!(err.missing, vec![Pose::Left]);

        let path = build_scan_photo_path("u1", "s2", Pose::Left);
        h.photos.put_photo(&path, Bytes::from_static(b"jpeg"), "image/jpeg").await.unwrap();

        let receipt = h
            .ingestor
            .complete(
                &ctx,
                "s2",
                CompleteScanRequest {
                    current_weight_kg: Some(90.0),
                    goal_weight_kg: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(receipt.status, ScanStatus::Queued);
        assert_eq!(receipt.photo_paths.len(), 4);

        let url = h.ingestor.download_url(&ctx, "s2", Pose::Left).await.unwrap();
        assert!(url.url.contains("method=GET"));
    }

    #[tokio::test]
    async fn test_upload_target_reopens_failed_scan() {
        let h = harness();
        let ctx = RequestContext::new("u1");

        h.ingestor.ingest(&ctx, form("s3", &ALL), &LIMIT).await.unwrap();
        h.sessions
            .upsert(SessionUpdate::new("u1", "s3").with_status(ScanStatus::Error))
            .await
            .unwrap();

        h.ingestor.upload_target(&ctx, "s3", Pose::Back).await.unwrap();
        assert_eq!(
            h.sessions.get("u1", "s3").await.unwrap().unwrap().status,
            ScanStatus::Uploading
        );
    }

    #[tokio::test]
    async fn test_unknown_scan_and_photo() {
        let h = harness();
        let ctx = RequestContext::new("u1");

        let err = h.ingestor.session(&ctx, "nope").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);

        let err = h.ingestor.download_url(&ctx, "nope", Pose::Front).await.unwrap_err();
        assert_eq!(err.reason, "photo_not_found");

        let err = h.ingestor.session(&ctx, "../etc").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }
}
