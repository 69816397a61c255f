//! Scan session document and its status machine.
//!
//! A session is keyed by `(uid, scan_id)`. Every write is an upsert: the first
//! write creates the document, later writes merge into it and never touch
//! `created_at`. This is what makes a re-submitted scan idempotent.

use crate::pose::Pose;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle of a scan upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Photos are still arriving
    Uploading,
    /// All four photos stored, waiting for analysis
    Queued,
    /// Analysis running
    Processing,
    /// Analysis finished
    Complete,
    /// Analysis failed
    Error,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Uploading => "uploading",
            ScanStatus::Queued => "queued",
            ScanStatus::Processing => "processing",
            ScanStatus::Complete => "complete",
            ScanStatus::Error => "error",
        }
    }

    /// Whether a session in this status may be moved to `next`.
    ///
    /// Writing the current status again is always allowed.
    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        use ScanStatus::*;

        self == next
            || matches!(
                (self, next),
                (Uploading, Queued)
                    | (Queued, Processing)
                    | (Queued, Error)
                    | (Processing, Complete)
                    | (Processing, Error)
                    | (Error, Uploading)
                    | (Error, Queued)
            )
    }

    /// Statuses that are only reachable once all four poses are stored.
    pub fn requires_all_poses(self) -> bool {
        matches!(
            self,
            ScanStatus::Queued | ScanStatus::Processing | ScanStatus::Complete
        )
    }

    /// Whether a client may (re-)submit photos for a session in this status.
    pub fn accepts_photos(self) -> bool {
        matches!(
            self,
            ScanStatus::Uploading | ScanStatus::Queued | ScanStatus::Error
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(ScanStatus::Uploading),
            "queued" => Ok(ScanStatus::Queued),
            "processing" => Ok(ScanStatus::Processing),
            "complete" => Ok(ScanStatus::Complete),
            "error" => Ok(ScanStatus::Error),
            other => Err(format!("unknown scan status: {other}")),
        }
    }
}

/// Errors raised when an update would break the session invariants.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("scan {scan_id} cannot move from {from} to {to}")]
    Illegal {
        scan_id: String,
        from: ScanStatus,
        to: ScanStatus,
    },

    #[error("scan {scan_id} cannot become {to} while poses {missing:?} are missing")]
    IncompletePoses {
        scan_id: String,
        to: ScanStatus,
        missing: Vec<Pose>,
    },

    #[error("update for {update_key} cannot be applied to session {session_key}")]
    KeyMismatch {
        session_key: String,
        update_key: String,
    },
}

/// The persisted scan upload document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanUploadSession {
    pub uid: String,
    pub scan_id: String,
    /// Storage path per pose
    pub photo_paths: BTreeMap<Pose, String>,
    pub status: ScanStatus,
    pub correlation_id: Option<String>,
    pub current_weight_kg: Option<f64>,
    pub goal_weight_kg: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A partial write to a session. `None` fields leave the stored value alone;
/// photo paths are merged pose by pose.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdate {
    pub uid: String,
    pub scan_id: String,
    pub photo_paths: BTreeMap<Pose, String>,
    pub status: Option<ScanStatus>,
    pub correlation_id: Option<String>,
    pub current_weight_kg: Option<f64>,
    pub goal_weight_kg: Option<f64>,
}

impl SessionUpdate {
    pub fn new(uid: impl Into<String>, scan_id: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            scan_id: scan_id.into(),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: ScanStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_photo_path(mut self, pose: Pose, path: impl Into<String>) -> Self {
        self.photo_paths.insert(pose, path.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_weights(mut self, current_kg: Option<f64>, goal_kg: Option<f64>) -> Self {
        self.current_weight_kg = current_kg;
        self.goal_weight_kg = goal_kg;
        self
    }

    fn key(&self) -> String {
        format!("{}/{}", self.uid, self.scan_id)
    }
}

impl ScanUploadSession {
    /// Create a session from its first write. New sessions start in
    /// `uploading` and then take the update's status, if any.
    pub fn create(update: SessionUpdate, now: DateTime<Utc>) -> Result<Self, TransitionError> {
        let mut session = Self {
            uid: update.uid.clone(),
            scan_id: update.scan_id.clone(),
            photo_paths: BTreeMap::new(),
            status: ScanStatus::Uploading,
            correlation_id: None,
            current_weight_kg: None,
            goal_weight_kg: None,
            created_at: now,
            updated_at: now,
        };
        session.apply(update, now)?;
        Ok(session)
    }

    /// Merge an update into this session. On error the session is unchanged.
    pub fn apply(&mut self, update: SessionUpdate, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if update.uid != self.uid || update.scan_id != self.scan_id {
            return Err(TransitionError::KeyMismatch {
                session_key: self.key(),
                update_key: update.key(),
            });
        }

        let mut photo_paths = self.photo_paths.clone();
        photo_paths.extend(update.photo_paths);

        let status = update.status.unwrap_or(self.status);
        if !self.status.can_transition_to(status) {
            return Err(TransitionError::Illegal {
                scan_id: self.scan_id.clone(),
                from: self.status,
                to: status,
            });
        }

        if status.requires_all_poses() {
            let missing = missing_poses(&photo_paths);
            if !missing.is_empty() {
                return Err(TransitionError::IncompletePoses {
                    scan_id: self.scan_id.clone(),
                    to: status,
                    missing,
                });
            }
        }

        self.photo_paths = photo_paths;
        self.status = status;
        if update.correlation_id.is_some() {
            self.correlation_id = update.correlation_id;
        }
        if update.current_weight_kg.is_some() {
            self.current_weight_kg = update.current_weight_kg;
        }
        if update.goal_weight_kg.is_some() {
            self.goal_weight_kg = update.goal_weight_kg;
        }
        self.updated_at = now;

        Ok(())
    }

    /// Poses that have no stored photo yet, in capture order.
    pub fn missing_poses(&self) -> Vec<Pose> {
        missing_poses(&self.photo_paths)
    }

    fn key(&self) -> String {
        format!("{}/{}", self.uid, self.scan_id)
    }
}

fn missing_poses(paths: &BTreeMap<Pose, String>) -> Vec<Pose> {
    Pose::ALL
        .into_iter()
        .filter(|pose| !paths.contains_key(pose))
        .collect()
}
