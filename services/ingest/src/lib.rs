//! Bodyscan Ingest Service
//!
//! Server half of the scan-photo pipeline. Accepts the four pose photos of a
//! body scan, checks that each pose is present exactly once and is a usable
//! JPEG, stores the photos and records the scan session so analysis can pick
//! it up.
//!
//! ## Features
//!
//! - **Multipart intake**: a streaming endpoint that stops reading at the
//!   first oversized part, and a buffered endpoint for small photos
//! - **Per-pose validation**: missing, duplicate and invalid photos are
//!   reported by name
//! - **Direct uploads**: presigned PUT targets per pose plus a completion call
//! - **Session tracking**: idempotent upserts over a small status machine,
//!   backed by PostgreSQL or an in-memory store with TTL
//!
//! ## Architecture
//!
//! ```text
//!   multipart body                      presigned PUT (client)
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ multipart    │──▶│ validation   │──▶│ PhotoStore   │  S3 / memory
//! └──────────────┘   └──────────────┘   └──────────────┘
//!                           │                  ▲
//!                           ▼                  │ exists?
//!                    ┌──────────────┐          │
//!                    │ ScanIngestor │──────────┘
//!                    └──────────────┘
//!                           │
//!                           ▼
//!                    ┌──────────────┐
//!                    │ SessionStore │  PostgreSQL / memory
//!                    └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod multipart;
pub mod photo_store;
pub mod scan_ingest;
pub mod session_store;
pub mod validation;

pub use api::{create_router, AppState};
pub use config::Config;
pub use error::{ApiError, ErrorCode, StoreError};
pub use multipart::{buffer_body, parse_buffered, parse_stream, MultipartError, ParsedForm, StreamLimits, UploadedFile};
pub use photo_store::{MemoryPhotoStore, PhotoStore, PresignedUrl, S3PhotoStore};
pub use scan_ingest::{CompleteScanRequest, RequestContext, ScanIngestor, ScanReceipt, UploadTarget};
pub use session_store::{MemorySessionStore, PgSessionStore, SessionStore};
pub use validation::{
    validate_pose_parts, FieldError, PhotoConstraints, PhotoIssue, PhotoProblem, PhotoValidationError,
    PosePhotos, ScanFields,
};
