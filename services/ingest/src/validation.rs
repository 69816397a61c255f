//! Checks applied to a decoded scan form before anything is stored.
//!
//! Every problem is reported against the field it belongs to so the client can
//! re-prompt for exactly the pose that needs retaking.

use crate::multipart::{ParsedForm, UploadedFile};
use bodyscan_common::Pose;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

const JPEG_CONTENT_TYPES: [&str; 2] = ["image/jpeg", "image/jpg"];
const MAX_SCAN_ID_LEN: usize = 128;
const MAX_WEIGHT_KG: f64 = 1000.0;

/// Per-endpoint photo constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhotoConstraints {
    pub max_bytes: usize,
}

impl PhotoConstraints {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoProblem {
    NotJpeg,
    Empty,
    TooLarge,
    Duplicate,
    Unexpected,
}

impl PhotoProblem {
    pub fn as_str(self) -> &'static str {
        match self {
            PhotoProblem::NotJpeg => "not_jpeg",
            PhotoProblem::Empty => "empty",
            PhotoProblem::TooLarge => "too_large",
            PhotoProblem::Duplicate => "duplicate",
            PhotoProblem::Unexpected => "unexpected",
        }
    }
}

/// One rejected file part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhotoIssue {
    pub field: String,
    pub problem: PhotoProblem,
}

impl PhotoIssue {
    pub fn new(field: impl Into<String>, problem: PhotoProblem) -> Self {
        Self {
            field: field.into(),
            problem,
        }
    }
}

/// Everything wrong with the photo parts of one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoValidationError {
    pub missing: Vec<Pose>,
    pub invalid: Vec<PhotoIssue>,
}

impl PhotoValidationError {
    pub fn missing(poses: Vec<Pose>) -> Self {
        Self {
            missing: poses,
            invalid: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty()
    }

    /// Most actionable problem first: missing, duplicate, invalid, unexpected.
    pub fn reason(&self) -> &'static str {
        let has = |problem: PhotoProblem| self.invalid.iter().any(|issue| issue.problem == problem);

        if !self.missing.is_empty() {
            "missing_photo"
        } else if has(PhotoProblem::Duplicate) {
            "duplicate_photo"
        } else if has(PhotoProblem::NotJpeg) || has(PhotoProblem::Empty) || has(PhotoProblem::TooLarge) {
            "invalid_photo"
        } else {
            "unexpected_file"
        }
    }
}

impl fmt::Display for PhotoValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            let poses: Vec<_> = self.missing.iter().map(|pose| pose.as_str()).collect();
            parts.push(format!("missing photos: {}", poses.join(", ")));
        }
        if !self.invalid.is_empty() {
            let issues: Vec<_> = self
                .invalid
                .iter()
                .map(|issue| format!("{} ({})", issue.field, issue.problem.as_str()))
                .collect();
            parts.push(format!("rejected parts: {}", issues.join(", ")));
        }
        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for PhotoValidationError {}

/// The four validated pose photos.
#[derive(Debug, Clone, PartialEq)]
pub struct PosePhotos(BTreeMap<Pose, UploadedFile>);

impl PosePhotos {
    pub fn get(&self, pose: Pose) -> Option<&UploadedFile> {
        self.0.get(&pose)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Pose, &UploadedFile)> {
        self.0.iter().map(|(pose, file)| (*pose, file))
    }

    pub fn total_bytes(&self) -> usize {
        self.0.values().map(|file| file.bytes.len()).sum()
    }
}

impl IntoIterator for PosePhotos {
    type Item = (Pose, UploadedFile);
    type IntoIter = std::collections::btree_map::IntoIter<Pose, UploadedFile>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Require exactly one JPEG part per pose, each non-empty and within the ceiling.
pub fn validate_pose_parts(
    files: Vec<UploadedFile>,
    constraints: &PhotoConstraints,
) -> Result<PosePhotos, PhotoValidationError> {
    let mut seen = BTreeMap::new();
    let mut photos = BTreeMap::new();
    let mut error = PhotoValidationError::default();

    for file in files {
        let Ok(pose) = file.field.parse::<Pose>() else {
            error.invalid.push(PhotoIssue::new(&file.field, PhotoProblem::Unexpected));
            continue;
        };

        let count = seen.entry(pose).or_insert(0usize);
        *count += 1;
        if *count == 2 {
            error.invalid.push(PhotoIssue::new(pose.as_str(), PhotoProblem::Duplicate));
        }
        if *count > 1 {
            photos.remove(&pose);
            continue;
        }

        match photo_problem(&file, constraints) {
            Some(problem) => error.invalid.push(PhotoIssue::new(pose.as_str(), problem)),
            None => {
                photos.insert(pose, file);
            }
        }
    }

    error.missing = Pose::ALL
        .into_iter()
        .filter(|pose| !seen.contains_key(pose))
        .collect();

    if error.is_empty() {
        Ok(PosePhotos(photos))
    } else {
        Err(error)
    }
}

fn photo_problem(file: &UploadedFile, constraints: &PhotoConstraints) -> Option<PhotoProblem> {
    let is_jpeg = file
        .content_type
        .as_deref()
        .map(|ct| JPEG_CONTENT_TYPES.iter().any(|jpeg| ct.eq_ignore_ascii_case(jpeg)))
        .unwrap_or(false);

    if !is_jpeg {
        Some(PhotoProblem::NotJpeg)
    } else if file.bytes.is_empty() {
        Some(PhotoProblem::Empty)
    } else if file.bytes.len() > constraints.max_bytes {
        Some(PhotoProblem::TooLarge)
    } else {
        None
    }
}

/// Scalar form field rejections.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldError {
    #[error("scanId must be 1-128 characters of letters, digits, '-' or '_'")]
    InvalidScanId,

    #[error("{field} must be a weight in kilograms, got {value:?}")]
    InvalidWeight { field: &'static str, value: String },
}

impl FieldError {
    pub fn field(&self) -> &'static str {
        match self {
            FieldError::InvalidScanId => "scanId",
            FieldError::InvalidWeight { field, .. } => field,
        }
    }
}

/// Scalar fields of a scan submission.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFields {
    pub scan_id: String,
    pub correlation_id: String,
    pub current_weight_kg: Option<f64>,
    pub goal_weight_kg: Option<f64>,
}

impl ScanFields {
    /// Read scalars from the form. Missing ids are generated; the
    /// `x-correlation-id` header wins over the form field.
    pub fn from_form(form: &ParsedForm, correlation_header: Option<&str>) -> Result<Self, FieldError> {
        let scan_id = match form.field(&["scanId"]) {
            Some(id) => validate_scan_id(id)?.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let correlation_id = correlation_header
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .or_else(|| form.field(&["correlationId"]))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Self {
            scan_id,
            correlation_id,
            current_weight_kg: parse_weight(form, "currentWeightKg", &["currentWeightKg", "currentWeight"])?,
            goal_weight_kg: parse_weight(form, "goalWeightKg", &["goalWeightKg", "goalWeight"])?,
        })
    }
}

/// Accept a client-chosen scan id if it is safe to use as a path component.
pub fn validate_scan_id(scan_id: &str) -> Result<&str, FieldError> {
    let valid = !scan_id.is_empty()
        && scan_id.len() <= MAX_SCAN_ID_LEN
        && scan_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(scan_id)
    } else {
        Err(FieldError::InvalidScanId)
    }
}

fn parse_weight(
    form: &ParsedForm,
    field: &'static str,
    aliases: &[&str],
) -> Result<Option<f64>, FieldError> {
    let Some(raw) = form.field(aliases) else {
        return Ok(None);
    };

    match raw.parse::<f64>() {
        Ok(kg) if kg.is_finite() && kg > 0.0 && kg < MAX_WEIGHT_KG => Ok(Some(kg)),
        _ => Err(FieldError::InvalidWeight {
            field,
            value: raw.to_string(),
        }),
    }
}
