//! Client-side quality gate.
//!
//! Every photo is scored against a fixed set of rules before the user spends a
//! scan credit. Each triggered rule subtracts its weight from a starting score
//! of 1.0 and contributes a human-readable guidance string. The gate passes
//! only if the average score clears [`GatePolicy::pass_score`] and no rule fired
//! on any photo.

use std::collections::BTreeSet;
use std::io::Cursor;

use bodyscan_common::Pose;
use bytes::Bytes;
use image::ImageReader;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::analyzer::{analyse_silhouette, laplacian_variance, load_image_data, AnalyzeError, DecodedImage};

/// Guidance strings shown to the user when a rule fires.
pub mod reasons {
    pub const LOW_RESOLUTION: &str = "Use a higher-resolution photo (long edge ≥1080px)";
    pub const ASPECT_RATIO: &str = "Hold the phone upright so your whole body fits the frame";
    pub const LIGHTING: &str = "Improve the lighting; the photo is too dark or too bright";
    pub const LOW_CONTRAST: &str =
        "Stand in front of a plain background that contrasts with your outfit";
    pub const BLURRY: &str = "Hold the camera steady; the photo is blurry";
    pub const OFF_CENTER: &str = "Center yourself in the frame";
    pub const DISTANCE: &str = "Adjust your distance so your body fills about half the frame";
    pub const BODY_CUT_OFF: &str = "Make sure your whole body is visible from head to feet";
    pub const ARMS_NOT_VISIBLE: &str = "Raise arms slightly so they are visible away from the torso";
    pub const TORSO_NOT_VISIBLE: &str = "Make sure your torso is clearly visible";
    pub const MISSING_PHOTOS: &str = "Capture all four poses before continuing";
    pub const REPEATED_POSE: &str = "Capture each pose only once";
}

/// An encoded photo tagged with the pose it shows.
#[derive(Debug, Clone)]
pub struct PoseImage {
    pub pose: Pose,
    pub blob: Bytes,
    pub width: u32,
    pub height: u32,
}

impl PoseImage {
    /// Wrap an encoded photo, reading its dimensions from the header.
    pub fn new(pose: Pose, blob: impl Into<Bytes>) -> Result<Self, AnalyzeError> {
        let blob = blob.into();
        let (width, height) = ImageReader::new(Cursor::new(blob.as_ref()))
            .with_guessed_format()
            .map_err(image::ImageError::IoError)?
            .into_dimensions()?;

        Ok(Self {
            pose,
            blob,
            width,
            height,
        })
    }
}

/// Raw measurements of a single photo.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateMetrics {
    pub brightness: f64,
    pub contrast: f64,
    pub sharpness: f64,
    /// width / height
    pub aspect_ratio: f64,
    pub center_offset_ratio: f64,
    pub subject_coverage: f64,
    pub subject_height_px: u32,
    pub shoulder_width: f64,
    pub waist_width: f64,
    pub hip_width: f64,
    pub height: u32,
    pub width: u32,
    pub long_edge: u32,
    /// Position of the photo in the capture sequence
    pub image_index: usize,
    /// Pose shown, when known
    #[serde(default)]
    pub pose: Option<Pose>,
}

impl GateMetrics {
    /// Measure a decoded photo.
    pub fn measure(image: &DecodedImage, image_index: usize, pose: Option<Pose>) -> Self {
        let silhouette = analyse_silhouette(image);

        Self {
            brightness: silhouette.brightness,
            contrast: silhouette.contrast,
            sharpness: laplacian_variance(image),
            aspect_ratio: f64::from(image.width) / f64::from(image.height),
            center_offset_ratio: silhouette.center_offset_ratio,
            subject_coverage: silhouette.subject_coverage,
            subject_height_px: silhouette.subject_height_px,
            shoulder_width: silhouette.shoulder_width,
            waist_width: silhouette.waist_width,
            hip_width: silhouette.hip_width,
            height: image.height,
            width: image.width,
            long_edge: image.width.max(image.height),
            image_index,
            pose,
        }
    }

    /// Front-pose rules apply to the front photo. Without an explicit pose the
    /// first photo of the sequence is assumed to be the front one.
    pub fn is_front_pose(&self) -> bool {
        match self.pose {
            Some(pose) => pose == Pose::Front,
            None => self.image_index == 0,
        }
    }
}

/// Thresholds and penalty weights of the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatePolicy {
    pub pass_score: f64,

    pub min_long_edge: u32,
    pub resolution_penalty: f64,

    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    pub aspect_penalty: f64,

    pub min_brightness: f64,
    pub max_brightness: f64,
    pub lighting_penalty: f64,

    pub min_contrast: f64,
    pub contrast_penalty: f64,

    pub min_sharpness: f64,
    pub sharpness_penalty: f64,

    pub max_center_offset: f64,
    pub center_penalty: f64,

    pub min_coverage: f64,
    pub max_coverage: f64,
    pub coverage_penalty: f64,

    /// Minimum subject height as a fraction of the frame height
    pub min_subject_height_ratio: f64,
    pub subject_height_penalty: f64,

    pub min_shoulder_waist_ratio: f64,
    pub arms_penalty: f64,
    pub torso_penalty: f64,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            pass_score: 0.7,
            min_long_edge: 1080,
            resolution_penalty: 0.35,
            min_aspect_ratio: 0.5,
            max_aspect_ratio: 2.5,
            aspect_penalty: 0.15,
            min_brightness: 40.0,
            max_brightness: 215.0,
            lighting_penalty: 0.20,
            min_contrast: 18.0,
            contrast_penalty: 0.20,
            min_sharpness: 14.0,
            sharpness_penalty: 0.25,
            max_center_offset: 0.18,
            center_penalty: 0.10,
            min_coverage: 0.18,
            max_coverage: 0.6,
            coverage_penalty: 0.10,
            min_subject_height_ratio: 0.6,
            subject_height_penalty: 0.20,
            min_shoulder_waist_ratio: 1.02,
            arms_penalty: 0.15,
            torso_penalty: 0.20,
        }
    }
}

/// Score and guidance for one photo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateEvaluation {
    pub score: f64,
    pub reasons: BTreeSet<String>,
}

impl GateEvaluation {
    fn new() -> Self {
        Self {
            score: 1.0,
            reasons: BTreeSet::new(),
        }
    }

    fn penalize(&mut self, weight: f64, reason: &str) {
        self.score = (self.score - weight).clamp(0.0, 1.0);
        self.reasons.insert(reason.to_string());
    }
}

/// Per-photo breakdown of a gate run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoGrade {
    pub pose: Pose,
    pub score: f64,
    pub reasons: BTreeSet<String>,
    pub metrics: GateMetrics,
}

/// Outcome of gating a full capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateResult {
    pub pass: bool,
    pub score: f64,
    pub reasons: BTreeSet<String>,
    pub photos: Vec<PhotoGrade>,
}

/// Score one photo against the default policy.
pub fn evaluate_gate_metrics(metrics: &GateMetrics) -> GateEvaluation {
    evaluate_gate_metrics_with(&GatePolicy::default(), metrics)
}

/// Score one photo against `policy`.
pub fn evaluate_gate_metrics_with(policy: &GatePolicy, m: &GateMetrics) -> GateEvaluation {
    let mut eval = GateEvaluation::new();

    if m.long_edge < policy.min_long_edge {
        eval.penalize(policy.resolution_penalty, reasons::LOW_RESOLUTION);
    }
    if !(policy.min_aspect_ratio..=policy.max_aspect_ratio).contains(&m.aspect_ratio) {
        eval.penalize(policy.aspect_penalty, reasons::ASPECT_RATIO);
    }
    if !(policy.min_brightness..=policy.max_brightness).contains(&m.brightness) {
        eval.penalize(policy.lighting_penalty, reasons::LIGHTING);
    }
    if m.contrast < policy.min_contrast {
        eval.penalize(policy.contrast_penalty, reasons::LOW_CONTRAST);
    }
    if m.sharpness < policy.min_sharpness {
        eval.penalize(policy.sharpness_penalty, reasons::BLURRY);
    }
    if m.center_offset_ratio > policy.max_center_offset {
        eval.penalize(policy.center_penalty, reasons::OFF_CENTER);
    }
    if !(policy.min_coverage..=policy.max_coverage).contains(&m.subject_coverage) {
        eval.penalize(policy.coverage_penalty, reasons::DISTANCE);
    }
    if f64::from(m.subject_height_px) < policy.min_subject_height_ratio * f64::from(m.height) {
        eval.penalize(policy.subject_height_penalty, reasons::BODY_CUT_OFF);
    }

    if m.is_front_pose() {
        if m.waist_width > 0.0 && m.shoulder_width / m.waist_width < policy.min_shoulder_waist_ratio {
            eval.penalize(policy.arms_penalty, reasons::ARMS_NOT_VISIBLE);
        }
        if m.waist_width <= 0.0 || m.hip_width <= 0.0 {
            eval.penalize(policy.torso_penalty, reasons::TORSO_NOT_VISIBLE);
        }
    }

    eval
}

/// Runs the gate over a full capture.
#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    policy: GatePolicy,
}

impl QualityGate {
    pub fn new(policy: GatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Decode, measure and score every photo.
    ///
    /// A photo that fails to decode blocks the whole gate.
    #[instrument(skip(self, images), fields(photos = images.len()))]
    pub fn evaluate(&self, images: &[PoseImage]) -> Result<GateResult, AnalyzeError> {
        metrics::counter!("capture.gate.evaluated").increment(1);

        if images.is_empty() {
            metrics::counter!("capture.gate.rejected").increment(1);
            return Ok(GateResult {
                pass: false,
                score: 0.0,
                reasons: BTreeSet::from([reasons::MISSING_PHOTOS.to_string()]),
                photos: Vec::new(),
            });
        }

        let mut photos = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            let decoded = load_image_data(&image.blob)?;
            let metrics = GateMetrics::measure(&decoded, index, Some(image.pose));
            let eval = evaluate_gate_metrics_with(&self.policy, &metrics);

            debug!(
                pose = %image.pose,
                score = eval.score,
                reasons = eval.reasons.len(),
                "Photo graded"
            );

            photos.push(PhotoGrade {
                pose: image.pose,
                score: eval.score,
                reasons: eval.reasons,
                metrics,
            });
        }

        let score = photos.iter().map(|p| p.score).sum::<f64>() / photos.len() as f64;
        let mut reasons: BTreeSet<String> = photos
            .iter()
            .flat_map(|p| p.reasons.iter().cloned())
            .collect();
        reasons.extend(capture_completeness(images).into_iter().map(str::to_string));
        let pass = score >= self.policy.pass_score && reasons.is_empty();

        if !pass {
            metrics::counter!("capture.gate.rejected").increment(1);
        }

        Ok(GateResult {
            pass,
            score,
            reasons,
            photos,
        })
    }
}

/// Reasons a capture is not exactly one photo per pose.
fn capture_completeness(images: &[PoseImage]) -> Vec<&'static str> {
    let mut seen = BTreeSet::new();
    let repeated = images.iter().any(|image| !seen.insert(image.pose));

    let mut found = Vec::new();
    if Pose::ALL.iter().any(|pose| !seen.contains(pose)) {
        found.push(reasons::MISSING_PHOTOS);
    }
    if repeated {
        found.push(reasons::REPEATED_POSE);
    }
    found
}

/// Gate a capture with the default policy.
pub fn client_quality_gate(images: &[PoseImage]) -> Result<GateResult, AnalyzeError> {
    QualityGate::default().evaluate(images)
}
