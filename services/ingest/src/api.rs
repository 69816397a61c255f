use crate::config::{ApiConfig, LimitsConfig};
use crate::error::ApiError;
use crate::multipart::{buffer_body, parse_buffered, parse_stream, StreamLimits};
use crate::photo_store::PresignedUrl;
use crate::scan_ingest::{CompleteScanRequest, RequestContext, ScanIngestor, ScanReceipt, UploadTarget};
use crate::validation::PhotoConstraints;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderMap, Request, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bodyscan_common::{Pose, ScanUploadSession};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<ScanIngestor>,
    pub limits: LimitsConfig,
}

impl AppState {
    pub fn new(ingestor: Arc<ScanIngestor>, limits: LimitsConfig) -> Self {
        Self { ingestor, limits }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let uid = header_value(&parts.headers, USER_ID_HEADER).ok_or_else(ApiError::unauthenticated)?;

        let mut ctx = RequestContext::new(uid);
        if let Some(correlation_id) = header_value(&parts.headers, CORRELATION_ID_HEADER) {
            ctx = ctx.with_correlation_id(correlation_id);
        }
        Ok(ctx)
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn request_content_type(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

fn parse_pose(pose: &str) -> Result<Pose, ApiError> {
    pose.parse()
        .map_err(|_| ApiError::invalid_argument("invalid_pose", format!("Unknown pose {pose:?}")))
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/scans/upload", post(upload_scan))
        .route("/api/scans/submit", post(submit_scan))
        .route("/api/scans/:scan_id", get(get_scan))
        .route("/api/scans/:scan_id/complete", post(complete_scan))
        .route("/api/scans/:scan_id/photos/:pose/upload-url", post(create_upload_url))
        .route("/api/scans/:scan_id/photos/:pose/url", get(get_download_url))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "bodyscan-ingest"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.ingestor.sessions().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "sessions": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "sessions": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Streaming multipart ingest; stops reading at the first exceeded ceiling.
async fn upload_scan(
    State(state): State<AppState>,
    ctx: RequestContext,
    request: Request<Body>,
) -> Result<Json<ScanReceipt>, ApiError> {
    let per_photo = state.limits.upload_max_photo_bytes;
    let limits = Pose::ALL.into_iter().fold(
        StreamLimits::new(
            state.limits.form_limit(per_photo) as u64,
            state.limits.max_field_bytes as u64,
        ),
        |limits, pose| limits.with_field_limit(pose.as_str(), per_photo as u64),
    );

    let content_type = request_content_type(request.headers()).to_string();
    let stream = request.into_body().into_data_stream();

    let form = parse_stream(stream, &content_type, &limits)
        .await
        .map_err(|e| ApiError::from(e).with_debug_id(&ctx.debug_id))?;

    state
        .ingestor
        .ingest(&ctx, form, &PhotoConstraints::new(per_photo))
        .await
        .map(Json)
        .map_err(|e| e.with_debug_id(&ctx.debug_id))
}

/// Buffered multipart ingest with the smaller per-photo ceiling.
async fn submit_scan(
    State(state): State<AppState>,
    ctx: RequestContext,
    request: Request<Body>,
) -> Result<Json<ScanReceipt>, ApiError> {
    let per_photo = state.limits.submit_max_photo_bytes;
    let content_type = request_content_type(request.headers()).to_string();

    let body = buffer_body(
        request.into_body().into_data_stream(),
        &content_type,
        state.limits.form_limit(per_photo),
    )
    .await
    .map_err(|e| ApiError::from(e).with_debug_id(&ctx.debug_id))?;

    let form = parse_buffered(body, &content_type)
        .await
        .map_err(|e| ApiError::from(e).with_debug_id(&ctx.debug_id))?;

    state
        .ingestor
        .ingest(&ctx, form, &PhotoConstraints::new(per_photo))
        .await
        .map(Json)
        .map_err(|e| e.with_debug_id(&ctx.debug_id))
}

async fn create_upload_url(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((scan_id, pose)): Path<(String, String)>,
) -> Result<Json<UploadTarget>, ApiError> {
    let pose = parse_pose(&pose).map_err(|e| e.with_debug_id(&ctx.debug_id))?;

    state
        .ingestor
        .upload_target(&ctx, &scan_id, pose)
        .await
        .map(Json)
        .map_err(|e| e.with_debug_id(&ctx.debug_id))
}

async fn get_download_url(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((scan_id, pose)): Path<(String, String)>,
) -> Result<Json<PresignedUrl>, ApiError> {
    let pose = parse_pose(&pose).map_err(|e| e.with_debug_id(&ctx.debug_id))?;

    state
        .ingestor
        .download_url(&ctx, &scan_id, pose)
        .await
        .map(Json)
        .map_err(|e| e.with_debug_id(&ctx.debug_id))
}

async fn complete_scan(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(scan_id): Path<String>,
    body: Bytes,
) -> Result<Json<ScanReceipt>, ApiError> {
    let request = if body.is_empty() {
        CompleteScanRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            ApiError::invalid_argument("invalid_body", format!("Invalid completion body: {e}"))
                .with_debug_id(&ctx.debug_id)
        })?
    };

    state
        .ingestor
        .complete(&ctx, &scan_id, request)
        .await
        .map(Json)
        .map_err(|e| e.with_debug_id(&ctx.debug_id))
}

async fn get_scan(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(scan_id): Path<String>,
) -> Result<Json<ScanUploadSession>, ApiError> {
    state
        .ingestor
        .session(&ctx, &scan_id)
        .await
        .map(Json)
        .map_err(|e| e.with_debug_id(&ctx.debug_id))
}

/// Start the ingest API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting ingest API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
