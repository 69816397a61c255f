//! Resilient photo uploads.
//!
//! ```text
//! UploadEngine ── per attempt ──> StorageTransport::start -> TransferHandle
//!      │                                   │ progress (watch)
//!      └── AttemptSupervisor <─────────────┘ + ConnectivityMonitor + ticks
//! ```

pub mod connectivity;
pub mod engine;
pub mod error;
pub mod http;
pub mod transport;
pub mod watchdog;

pub use connectivity::{ConnectivityMonitor, NetworkStatus};
pub use engine::{UploadEngine, UploadParams, UploadPolicy, UploadProgress, UploadedPhoto};
pub use error::{TransportError, UploadError, UploadFailure};
pub use http::HttpStorageTransport;
pub use transport::{
    PhotoTarget, StorageTransport, StoredObject, TransferControl, TransferHandle, TransferReporter,
    TransferRequest, TransferSnapshot, TransferState,
};
pub use watchdog::{AttemptSupervisor, UploadAttempt, WatchdogLimits};
