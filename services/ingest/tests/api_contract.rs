use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use bodyscan_common::{build_scan_photo_path, Pose, ScanStatus, ScanUploadSession, SessionUpdate};
use bodyscan_ingest::config::{ApiConfig, LimitsConfig};
use bodyscan_ingest::{
    create_router, AppState, MemoryPhotoStore, MemorySessionStore, PhotoStore, ScanIngestor,
    SessionStore, StoreError,
};
use bytes::Bytes;
use mockall::mock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const BOUNDARY: &str = "XbodyscanX";
const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

mock! {
    pub Sessions {}

    #[async_trait]
    impl SessionStore for Sessions {
        async fn get(&self, uid: &str, scan_id: &str) -> Result<Option<ScanUploadSession>, StoreError>;
        async fn upsert(&self, update: SessionUpdate) -> Result<ScanUploadSession, StoreError>;
        async fn ping(&self) -> Result<(), StoreError>;
    }
}

struct TestApp {
    router: Router,
    photos: Arc<MemoryPhotoStore>,
    sessions: Arc<MemorySessionStore>,
}

fn app_with_limits(limits: LimitsConfig) -> TestApp {
    let photos = Arc::new(MemoryPhotoStore::new("test-bucket"));
    let sessions = Arc::new(MemorySessionStore::new(Duration::from_secs(3600)));
    let ingestor = ScanIngestor::new(photos.clone(), sessions.clone(), Duration::from_secs(900));
    let router = create_router(
        AppState::new(Arc::new(ingestor), limits),
        &ApiConfig::default(),
    );
    TestApp {
        router,
        photos,
        sessions,
    }
}

fn app() -> TestApp {
    app_with_limits(LimitsConfig::default())
}

fn app_with_sessions(sessions: MockSessions) -> Router {
    let ingestor = ScanIngestor::new(
        Arc::new(MemoryPhotoStore::new("test-bucket")),
        Arc::new(sessions),
        Duration::from_secs(900),
    );
    create_router(
        AppState::new(Arc::new(ingestor), LimitsConfig::default()),
        &ApiConfig::default(),
    )
}

#[derive(Default)]
struct FormBuilder {
    body: Vec<u8>,
}

impl FormBuilder {
    fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                .as_bytes(),
        );
        self
    }

    fn file(mut self, name: &str, content_type: &str, data: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{name}.jpg\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    fn poses(self, poses: &[&str]) -> Self {
        poses
            .iter()
            .fold(self, |form, pose| form.file(pose, "image/jpeg", JPEG))
    }

    fn build(mut self) -> Bytes {
        self.body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Bytes::from(self.body)
    }
}

fn multipart_request(uri: &str, uid: Option<&str>, body: Bytes) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"));
    if let Some(uid) = uid {
        builder = builder.header("x-user-id", uid);
    }
    builder.body(Body::from(body)).unwrap()
}

fn request(method: &str, uri: &str, uid: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user-id", uid)
        .body(Body::empty())
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

const ALL: [&str; 4] = ["front", "back", "left", "right"];

#[tokio::test]
async fn test_streaming_upload_queues_scan() {
    let app = app();
    let body = FormBuilder::default()
        .text("scanId", "scan-1")
        .poses(&["left", "front", "right", "back"])
        .text("currentWeightKg", "84.2")
        .text("goalWeight", "78")
        .build();

    let mut req = multipart_request("/api/scans/upload", Some("user-1"), body);
    req.headers_mut()
        .insert("x-correlation-id", "corr-42".parse().unwrap());
    let (status, json) = send(&app.router, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["scanId"], "scan-1");
    assert_eq!(json["status"], "queued");
    assert_eq!(json["correlationId"], "corr-42");
    assert!(json["debugId"].as_str().is_some_and(|id| !id.is_empty()));
    for pose in Pose::ALL {
        assert_eq!(
            json["photoPaths"][pose.as_str()],
            build_scan_photo_path("user-1", "scan-1", pose)
        );
    }

    assert_eq!(app.photos.len(), 4);
    let session = app.sessions.get("user-1", "scan-1").await.unwrap().unwrap();
    assert_eq!(session.current_weight_kg, Some(84.2));
    assert_eq!(session.goal_weight_kg, Some(78.0));
}

#[tokio::test]
async fn test_buffered_submit_generates_scan_id() {
    let app = app();
    let body = FormBuilder::default().poses(&ALL).build();

    let (status, json) = send(&app.router, multipart_request("/api/scans/submit", Some("user-1"), body)).await;

    assert_eq!(status, StatusCode::OK);
    let scan_id = json["scanId"].as_str().unwrap();
    assert!(uuid::Uuid::parse_str(scan_id).is_ok());
    assert!(app.sessions.get("user-1", scan_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_missing_pose_is_named() {
    let app = app();
    let body = FormBuilder::default().poses(&["front", "back", "right"]).build();

    for uri in ["/api/scans/upload", "/api/scans/submit"] {
        let (status, json) = send(&app.router, multipart_request(uri, Some("user-1"), body.clone())).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["ok"], false);
        assert_eq!(json["code"], "invalid-argument");
        assert_eq!(json["reason"], "missing_photo");
        assert_eq!(json["missing"], serde_json::json!(["left"]));
    }
    assert!(app.photos.is_empty());
}

#[tokio::test]
async fn test_invalid_parts_are_listed() {
    let app = app();
    let body = FormBuilder::default()
        .file("front", "image/png", JPEG)
        .file("back", "image/jpeg", b"")
        .poses(&["left", "right"])
        .build();

    let (status, json) = send(&app.router, multipart_request("/api/scans/submit", Some("user-1"), body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["reason"], "invalid_photo");
    assert_eq!(
        json["invalid"],
        serde_json::json!([
            {"field": "front", "problem": "not_jpeg"},
            {"field": "back", "problem": "empty"}
        ])
    );
}

#[tokio::test]
async fn test_endpoint_ceilings_are_separate() {
    let app = app_with_limits(LimitsConfig {
        upload_max_photo_bytes: 64,
        submit_max_photo_bytes: 16,
        ..LimitsConfig::default()
    });
    let big = vec![0xFF; 32];
    let body = FormBuilder::default()
        .file("front", "image/jpeg", &big)
        .poses(&["back", "left", "right"])
        .build();

    let (status, _) = send(&app.router, multipart_request("/api/scans/upload", Some("user-1"), body.clone())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = send(&app.router, multipart_request("/api/scans/submit", Some("user-2"), body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        json["invalid"],
        serde_json::json!([{"field": "front", "problem": "too_large"}])
    );
}

#[tokio::test]
async fn test_streaming_upload_stops_at_oversized_photo() {
    let app = app_with_limits(LimitsConfig {
        upload_max_photo_bytes: 64,
        ..LimitsConfig::default()
    });
    let body = FormBuilder::default()
        .poses(&["front", "back"])
        .file("left", "image/jpeg", &vec![0xFF; 4096])
        .poses(&["right"])
        .build();

    let (status, json) = send(&app.router, multipart_request("/api/scans/upload", Some("user-1"), body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["reason"], "invalid_photo");
    assert_eq!(
        json["invalid"],
        serde_json::json!([{"field": "left", "problem": "too_large"}])
    );
    assert!(app.photos.is_empty());
}

#[tokio::test]
async fn test_buffered_submit_names_photo_past_body_limit() {
    let app = app_with_limits(LimitsConfig {
        submit_max_photo_bytes: 16,
        form_overhead_bytes: 512,
        ..LimitsConfig::default()
    });
    let body = FormBuilder::default()
        .poses(&["front", "back"])
        .file("left", "image/jpeg", &vec![0xFF; 4096])
        .poses(&["right"])
        .build();

    let (status, json) = send(&app.router, multipart_request("/api/scans/submit", Some("user-1"), body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["reason"], "invalid_photo");
    assert_eq!(
        json["invalid"],
        serde_json::json!([{"field": "left", "problem": "too_large"}])
    );
    assert!(app.photos.is_empty());
}

#[tokio::test]
async fn test_missing_identity_is_unauthenticated() {
    let app = app();
    let body = FormBuilder::default().poses(&ALL).build();

    let (status, json) = send(&app.router, multipart_request("/api/scans/upload", None, body)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["code"], "unauthenticated");
}

#[tokio::test]
async fn test_malformed_body() {
    let app = app();
    let req = Request::builder()
        .method("POST")
        .uri("/api/scans/submit")
        .header("x-user-id", "user-1")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();

    let (status, json) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["reason"], "malformed_multipart");
}

#[tokio::test]
async fn test_locked_scan_is_failed_precondition() {
    let app = app();
    let body = FormBuilder::default().text("scanId", "scan-9").poses(&ALL).build();

    let (status, _) = send(&app.router, multipart_request("/api/scans/submit", Some("user-1"), body.clone())).await;
    assert_eq!(status, StatusCode::OK);

    app.sessions
        .upsert(SessionUpdate::new("user-1", "scan-9").with_status(ScanStatus::Processing))
        .await
        .unwrap();

    let (status, json) = send(&app.router, multipart_request("/api/scans/submit", Some("user-1"), body)).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(json["code"], "failed-precondition");
}

#[tokio::test]
async fn test_direct_upload_and_complete() {
    let app = app();

    let (status, json) = send(
        &app.router,
        request("POST", "/api/scans/scan-5/photos/front/upload-url", "user-1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["path"], "user_uploads/user-1/scans/scan-5/front.jpg");
    assert_eq!(
        json["storagePath"],
        "memory://test-bucket/user_uploads/user-1/scans/scan-5/front.jpg"
    );
    assert!(json["expiresAt"].is_string());

    let (status, json) = send(&app.router, request("POST", "/api/scans/scan-5/complete", "user-1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["missing"], serde_json::json!(["front", "back", "left", "right"]));

    for pose in Pose::ALL {
        app.photos
            .put_photo(
                &build_scan_photo_path("user-1", "scan-5", pose),
                Bytes::from_static(JPEG),
                "image/jpeg",
            )
            .await
            .unwrap();
    }

    let mut req = request("POST", "/api/scans/scan-5/complete", "user-1");
    req.headers_mut()
        .insert("content-type", "application/json".parse().unwrap());
    *req.body_mut() = Body::from(r#"{"currentWeightKg": 91.0, "goalWeight": 85}"#);
    let (status, json) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "queued");

    let (status, json) = send(&app.router, request("GET", "/api/scans/scan-5", "user-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "queued");
    assert_eq!(json["goalWeightKg"], 85.0);

    let (status, json) = send(&app.router, request("GET", "/api/scans/scan-5/photos/back/url", "user-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["url"].as_str().unwrap().contains("back.jpg"));
}

#[tokio::test]
async fn test_unknown_pose_and_scan() {
    let app = app();

    let (status, json) = send(
        &app.router,
        request("POST", "/api/scans/scan-1/photos/side/upload-url", "user-1"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["reason"], "invalid_pose");

    let (status, _) = send(&app.router, request("GET", "/api/scans/unknown", "user-1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_and_readiness() {
    let app = app();

    let (status, json) = send(&app.router, request("GET", "/health", "anyone")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");

    let (status, json) = send(&app.router, request("GET", "/ready", "anyone")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ready");
}

#[tokio::test]
async fn test_readiness_fails_when_store_is_down() {
    let mut sessions = MockSessions::new();
    sessions
        .expect_ping()
        .returning(|| Err(StoreError::Database(sqlx::Error::PoolTimedOut)));

    let (status, json) = send(&app_with_sessions(sessions), request("GET", "/ready", "anyone")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "not_ready");
}

#[tokio::test]
async fn test_store_outage_is_unavailable() {
    let mut sessions = MockSessions::new();
    sessions
        .expect_get()
        .returning(|_, _| Err(StoreError::Database(sqlx::Error::PoolTimedOut)));
    sessions.expect_upsert().never();

    let body = FormBuilder::default().poses(&ALL).build();
    let (status, json) = send(
        &app_with_sessions(sessions),
        multipart_request("/api/scans/upload", Some("user-1"), body),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["code"], "unavailable");
    assert_eq!(json["reason"], "storage_unavailable");
}
