//! Bodyscan Common - shared scan domain for the capture client and ingest service
//!
//! Both sides of the scan-photo pipeline agree on a handful of facts, and this
//! crate is where they live:
//!
//! - The four canonical [`Pose`]s a body scan is made of
//! - Where each pose photo is stored ([`build_scan_photo_path`])
//! - The scan session document and its status machine ([`ScanUploadSession`],
//!   [`ScanStatus`])
//!
//! # Example
//!
//! ```rust
//! use bodyscan_common::{build_scan_photo_path, Pose};
//!
//! let path = build_scan_photo_path("user-1", "scan-42", Pose::Front);
//! assert_eq!(path, "user_uploads/user-1/scans/scan-42/front.jpg");
//! ```

pub mod paths;
pub mod pose;
pub mod session;

// Re-export main types
pub use paths::{build_scan_photo_path, sanitize_path_component, PHOTO_CONTENT_TYPE};
pub use pose::{ParsePoseError, Pose};
pub use session::{
    ScanStatus, ScanUploadSession, SessionUpdate, TransitionError,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::paths::build_scan_photo_path;
    pub use crate::pose::Pose;
    pub use crate::session::{ScanStatus, ScanUploadSession, SessionUpdate};
}
