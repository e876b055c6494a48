use std::sync::Arc;
use std::time::Instant;

use nalgebra as na;
use opencv::calib3d;
use opencv::core::{self as cv, DMatch, Mat, Point2f, Vector};
use opencv::features2d::BFMatcher;
use opencv::prelude::*;

use crate::bbox::{BBox, Xywh};
use crate::config::{MatcherConfig, ScaleConfig};
use crate::error::Result;
use crate::features::{self, FeatureSet};
use crate::frame::GrayFrame;
use crate::math;
use crate::reference::ReferenceFeatureIndex;
use crate::result::{RungAttempt, RungRejection};
use crate::selector;
use crate::viewport::Viewport;

/// A homography needs four correspondences.
const MIN_HOMOGRAPHY_MATCHES: usize = 4;

/// Reference-space region to restrict the search to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    pub viewport: BBox<Xywh>,
    pub expansion: f64,
}

/// Outcome of one rung. OpenCV failures are errors; quality shortfalls live in `attempt.rejection`.
#[derive(Debug, Clone)]
pub struct RungOutcome {
    pub attempt: RungAttempt,
    pub viewport: Option<Viewport>,
    pub roi_applied: bool,
    /// Reference keypoints the frame was matched against.
    pub searched: usize,
}

impl RungOutcome {
    #[inline]
    pub fn accepted(&self) -> bool {
        self.attempt.accepted
    }
}

/// Single-scale registration of a frame against the shared reference features.
pub struct FrameMatcher {
    reference: Arc<ReferenceFeatureIndex>,
    cfg: MatcherConfig,
}

impl FrameMatcher {
    pub fn new(reference: Arc<ReferenceFeatureIndex>, cfg: MatcherConfig) -> Self {
        Self { reference, cfg }
    }

    #[inline]
    pub fn reference(&self) -> &Arc<ReferenceFeatureIndex> {
        &self.reference
    }

    #[inline]
    pub fn config(&self) -> &MatcherConfig {
        &self.cfg
    }

    /// Resamples `frame` to the rung's scale and registers it.
    pub fn match_frame(&self, frame: &GrayFrame, rung: &ScaleConfig, roi: Option<&Roi>) -> Result<RungOutcome> {
        let started = Instant::now();
        let scaled = frame.resized(rung.scale)?;

        let mut outcome = self.match_scaled(&scaled, rung, roi)?;
        outcome.viewport = outcome
            .viewport
            .map(|v| Viewport { timestamp: frame.timestamp, ..v });
        outcome.attempt.elapsed = started.elapsed();

        tracing::debug!(
            rung = %rung.name,
            accepted = outcome.attempt.accepted,
            confidence = outcome.attempt.confidence,
            inliers = outcome.attempt.inliers,
            matches = outcome.attempt.matches,
            searched = outcome.searched,
            roi = outcome.roi_applied,
            "rung finished"
        );

        Ok(outcome)
    }

    /// Registers a frame already at working resolution.
    pub fn match_scaled(&self, frame: &GrayFrame, rung: &ScaleConfig, roi: Option<&Roi>) -> Result<RungOutcome> {
        let started = Instant::now();
        let frame_features = self.detect_frame_features(frame, rung.max_features)?;

        let mut outcome = RungOutcome {
            attempt: RungAttempt {
                name: rung.name.clone(),
                scale: rung.scale,
                elapsed: Default::default(),
                confidence: 0.0,
                inliers: 0,
                matches: 0,
                accepted: false,
                rejection: None,
            },
            viewport: None,
            roi_applied: false,
            searched: self.reference.len(),
        };

        if frame_features.is_empty() {
            outcome.attempt.rejection = Some(RungRejection::NoFeatures);
            outcome.attempt.elapsed = started.elapsed();
            return Ok(outcome);
        }

        let roi_indices = roi.and_then(|r| self.roi_indices(r));
        if let Some(idx) = &roi_indices {
            outcome.roi_applied = true;
            outcome.searched = idx.len();
        }

        let required = rung.min_matches.max(MIN_HOMOGRAPHY_MATCHES);
        let good = self.ratio_matches(&frame_features, roi_indices.as_deref())?;
        outcome.attempt.matches = good.len();

        if good.len() < required {
            outcome.attempt.rejection = Some(RungRejection::InsufficientMatches {
                matches: good.len(),
                required,
            });
            outcome.attempt.elapsed = started.elapsed();
            return Ok(outcome);
        }

        let fit = self.fit_homography(&frame_features, &good)?;
        let (h, inliers) = match fit {
            Some(fit) => fit,
            None => {
                outcome.attempt.rejection = Some(RungRejection::HomographyFailed { matches: good.len() });
                outcome.attempt.elapsed = started.elapsed();
                return Ok(outcome);
            }
        };

        let ratio = inliers as f64 / good.len() as f64;
        outcome.attempt.inliers = inliers;
        outcome.attempt.confidence = ratio;

        let bounds = math::project_frame_bounds(&h, frame.width() as f64, frame.height() as f64)
            .map(|b| b.as_ltwh())
            .filter(|b| b.width() > 0.0 && b.height() > 0.0);

        let bounds = match bounds {
            Some(b) => b,
            None => {
                outcome.attempt.rejection = Some(RungRejection::HomographyFailed { matches: good.len() });
                outcome.attempt.elapsed = started.elapsed();
                return Ok(outcome);
            }
        };

        if inliers < rung.min_inliers || ratio < rung.min_confidence {
            outcome.attempt.rejection = Some(RungRejection::QualityInsufficient {
                inliers,
                matches: good.len(),
            });
            outcome.attempt.elapsed = started.elapsed();
            return Ok(outcome);
        }

        outcome.attempt.accepted = true;
        outcome.viewport = Some(Viewport::new(bounds, ratio, frame.timestamp));
        outcome.attempt.elapsed = started.elapsed();

        Ok(outcome)
    }

    fn detect_frame_features(&self, frame: &GrayFrame, max_features: usize) -> Result<FeatureSet> {
        let target = if max_features > 0 {
            max_features
        } else {
            self.cfg.max_screenshot_features
        };

        let oversample = if self.cfg.use_spatial_distribution {
            self.cfg.detection_oversample.max(1)
        } else {
            1
        };

        let detected = features::detect_orb(frame, target * oversample, &self.cfg.detector)?;
        if detected.len() <= target {
            return Ok(detected);
        }

        let (w, h) = frame.dims();
        let ratio = selector::spatial_ratio_for_density(detected.len(), w, h);
        let idx = selector::select_hybrid(&detected.keypoints, w, h, target, ratio);

        Ok(detected.subset(&idx))
    }

    /// `None` when no restriction applies: degenerate ROI or no reference keypoints inside it.
    fn roi_indices(&self, roi: &Roi) -> Option<Vec<usize>> {
        let vp = &roi.viewport;
        let usable = vp.is_finite() && vp.width() > 0.0 && vp.height() > 0.0 && roi.expansion > 0.0;

        if !usable {
            tracing::debug!(roi = ?vp.as_slice(), "degenerate ROI ignored");
            return None;
        }

        let idx = self.reference.index.query_viewport_expanded(vp, roi.expansion);
        if idx.len() < 2 {
            tracing::debug!(found = idx.len(), "ROI holds too few reference keypoints, searching everything");
            return None;
        }

        Some(idx)
    }

    /// kNN (k = 2) matches passing the ratio test, as `(frame_idx, reference_idx)`.
    fn ratio_matches(&self, frame: &FeatureSet, roi: Option<&[usize]>) -> Result<Vec<(usize, usize)>> {
        let train_len = roi.map_or(self.reference.len(), |r| r.len());
        if train_len < 2 {
            return Ok(Vec::new());
        }

        let query = frame.descriptor_mat(None)?;
        let train = self.reference.features.descriptor_mat(roi)?;

        let matcher = BFMatcher::create(cv::NORM_HAMMING, false)?;
        let mut knn = Vector::<Vector<DMatch>>::new();
        matcher.knn_train_match(&query, &train, &mut knn, 2, &Mat::default(), false)?;

        let ratio = self.cfg.ratio_test_threshold as f32;
        let mut good = Vec::new();

        for pair in knn.iter() {
            if pair.len() < 2 {
                continue;
            }

            let (m, n) = (pair.get(0)?, pair.get(1)?);
            if m.distance < ratio * n.distance {
                let train_idx = m.train_idx as usize;
                let ref_idx = roi.map_or(train_idx, |r| r[train_idx]);

                good.push((m.query_idx as usize, ref_idx));
            }
        }

        Ok(good)
    }

    /// RANSAC homography from frame to reference pixels, with its inlier count.
    fn fit_homography(&self, frame: &FeatureSet, good: &[(usize, usize)]) -> Result<Option<(na::Matrix3<f64>, usize)>> {
        let mut src = Vector::<Point2f>::with_capacity(good.len());
        let mut dst = Vector::<Point2f>::with_capacity(good.len());

        for &(q, t) in good {
            let a = &frame.keypoints[q];
            let b = &self.reference.features.keypoints[t];

            src.push(Point2f::new(a.x as f32, a.y as f32));
            dst.push(Point2f::new(b.x as f32, b.y as f32));
        }

        let mut mask = Mat::default();
        let h = calib3d::find_homography(&src, &dst, &mut mask, calib3d::RANSAC, self.cfg.ransac_threshold)?;

        if h.empty() || h.rows() != 3 || h.cols() != 3 {
            return Ok(None);
        }

        let mut m = na::Matrix3::zeros();
        for r in 0..3 {
            for c in 0..3 {
                m[(r, c)] = *h.at_2d::<f64>(r as i32, c as i32)?;
            }
        }

        if !m.iter().all(|v| v.is_finite()) {
            return Ok(None);
        }

        let inliers = cv::count_non_zero(&mask)? as usize;

        Ok(Some((m, inliers)))
    }
}
