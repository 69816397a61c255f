//! Bodyscan capture client
//!
//! Client half of the scan pipeline: grade the four pose photos before a scan
//! credit is spent, then push each photo to storage through an upload engine
//! that survives stalls, backgrounding and connectivity loss.
//!
//! # Components
//!
//! - [`analyzer`]: pixel statistics (brightness, contrast, silhouette, sharpness)
//! - [`gate`]: rule-based quality score per photo and for the whole capture
//! - [`hash`]: perceptual hash to catch the same photo used for two poses
//! - [`upload`]: retrying, watchdog-supervised uploads over a pluggable transport
//! - [`api_client`]: ingest API calls (upload targets, completion)

pub mod analyzer;
pub mod api_client;
pub mod config;
pub mod gate;
pub mod hash;
pub mod upload;

pub use analyzer::{analyse_silhouette, laplacian_variance, load_image_data, AnalyzeError, DecodedImage};
pub use gate::{
    client_quality_gate, evaluate_gate_metrics, evaluate_gate_metrics_with, GateEvaluation,
    GateMetrics, GatePolicy, GateResult, PoseImage, QualityGate,
};
pub use hash::{compute_image_hash, find_duplicate_photos, hamming_distance};
pub use upload::{UploadEngine, UploadError, UploadParams, UploadedPhoto};
