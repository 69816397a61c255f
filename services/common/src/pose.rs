//! The four canonical scan angles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One of the four photos a body scan is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pose {
    Front,
    Back,
    Left,
    Right,
}

/// Returned when a string does not name a pose.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown pose: {0:?}")]
pub struct ParsePoseError(pub String);

impl Pose {
    /// All poses in capture order. Capture position `i` holds `ALL[i]`.
    pub const ALL: [Pose; 4] = [Pose::Front, Pose::Back, Pose::Left, Pose::Right];

    pub fn as_str(self) -> &'static str {
        match self {
            Pose::Front => "front",
            Pose::Back => "back",
            Pose::Left => "left",
            Pose::Right => "right",
        }
    }

    /// Position of this pose in the capture sequence.
    pub fn index(self) -> usize {
        match self {
            Pose::Front => 0,
            Pose::Back => 1,
            Pose::Left => 2,
            Pose::Right => 3,
        }
    }

    /// Pose captured at the given position, if any.
    pub fn from_index(index: usize) -> Option<Pose> {
        Self::ALL.get(index).copied()
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pose {
    type Err = ParsePoseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "front" => Ok(Pose::Front),
            "back" => Ok(Pose::Back),
            "left" => Ok(Pose::Left),
            "right" => Ok(Pose::Right),
            _ => Err(ParsePoseError(s.to_string())),
        }
    }
}
