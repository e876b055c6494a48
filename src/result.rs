use std::fmt;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::viewport::Viewport;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    /// Homography from descriptor matches.
    Feature,
    /// Phase-correlation shift applied to the previous viewport.
    MotionOnly,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchType::Feature => f.write_str("feature"),
            MatchType::MotionOnly => f.write_str("motion_only"),
        }
    }
}

/// Why a single rung did not produce an accepted registration.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RungRejection {
    NoFeatures,
    InsufficientMatches { matches: usize, required: usize },
    HomographyFailed { matches: usize },
    QualityInsufficient { inliers: usize, matches: usize },
}

impl fmt::Display for RungRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RungRejection::NoFeatures => f.write_str("no features in frame"),
            RungRejection::InsufficientMatches { matches, required } => {
                write!(f, "{} matches, {} required", matches, required)
            }
            RungRejection::HomographyFailed { matches } => {
                write!(f, "homography estimation failed on {} matches", matches)
            }
            RungRejection::QualityInsufficient { inliers, matches } => {
                write!(f, "{}/{} inliers below gate", inliers, matches)
            }
        }
    }
}

/// One line of the cascade diagnostics trail.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RungAttempt {
    pub name: String,
    pub scale: f64,
    pub elapsed: Duration,
    pub confidence: f64,
    pub inliers: usize,
    pub matches: usize,
    pub accepted: bool,
    pub rejection: Option<RungRejection>,
}

/// Accepted placement of a frame in the reference.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Registration {
    pub viewport: Viewport,
    pub inliers: usize,
    pub total_matches: usize,
    pub match_type: MatchType,
    pub trail: Vec<RungAttempt>,
    pub elapsed: Duration,
    pub roi_applied: bool,
}

impl Registration {
    #[inline]
    pub fn confidence(&self) -> f64 {
        self.viewport.confidence
    }

    /// Name of the rung that accepted, `None` for motion-only results.
    pub fn accepted_rung(&self) -> Option<&str> {
        self.trail
            .iter()
            .find(|a| a.accepted)
            .map(|a| a.name.as_str())
    }
}

/// Every rung rejected the frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MatchFailure {
    pub trail: Vec<RungAttempt>,
    pub elapsed: Duration,
}

impl MatchFailure {
    pub fn best_attempt(&self) -> Option<&RungAttempt> {
        self.trail
            .iter()
            .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
    }
}
