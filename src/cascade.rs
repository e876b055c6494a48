use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::bbox::BBox;
use crate::config::{BypassConfig, EngineConfig, ScaleConfig};
use crate::error::{Error, Result};
use crate::frame::GrayFrame;
use crate::frame_matcher::{FrameMatcher, Roi};
use crate::reference::ReferenceFeatureIndex;
use crate::result::{MatchFailure, MatchType, Registration};
use crate::translation::{TranslationEstimate, TranslationTracker};
use crate::viewport::Viewport;

/// Cooperative stop flag shared between a caller and a running registration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Anything that places frames in reference space, frame after frame.
pub trait FrameRegistrar: Send {
    /// `hint` is an externally predicted search region. A cancelled call must not
    /// commit a viewport.
    fn register(&mut self, frame: &GrayFrame, hint: Option<&Roi>, cancel: &CancelToken) -> Result<Registration>;

    fn reset(&mut self);
}

/// Motion-only bypass in front of an ordered multi-scale fallback.
pub struct CascadeScaleMatcher {
    matcher: FrameMatcher,
    rungs: Vec<ScaleConfig>,
    bypass: BypassConfig,
    translation: TranslationTracker,
    last: Option<Viewport>,
    /// Carried confidence; decays on every motion-only frame.
    prior_confidence: f64,
    consecutive_motion: usize,
}

impl CascadeScaleMatcher {
    pub fn new(reference: Arc<ReferenceFeatureIndex>, cfg: &EngineConfig) -> Result<Self> {
        cfg.validate()?;

        if reference.is_empty() {
            return Err(Error::NoReferenceFeatures);
        }

        let mut rungs = cfg.cascade.clone();
        rungs.sort_by(|a, b| a.scale.partial_cmp(&b.scale).unwrap_or(std::cmp::Ordering::Equal));

        for (i, r) in rungs.iter().enumerate() {
            tracing::info!(level = i + 1, "cascade rung {}", r);
        }

        Ok(Self {
            matcher: FrameMatcher::new(reference, cfg.matcher.clone()),
            rungs,
            bypass: cfg.bypass.clone(),
            translation: TranslationTracker::new(cfg.translation.clone()),
            last: None,
            prior_confidence: 0.0,
            consecutive_motion: 0,
        })
    }

    /// Rungs in the order they are tried.
    #[inline]
    pub fn rungs(&self) -> &[ScaleConfig] {
        &self.rungs
    }

    #[inline]
    pub fn last_viewport(&self) -> Option<&Viewport> {
        self.last.as_ref()
    }

    #[inline]
    pub fn prior_confidence(&self) -> f64 {
        self.prior_confidence
    }

    #[inline]
    pub fn consecutive_motion_frames(&self) -> usize {
        self.consecutive_motion
    }

    fn bypass_allowed(&self, est: &TranslationEstimate) -> bool {
        let b = &self.bypass;

        if self.prior_confidence < b.recalibration_floor || self.consecutive_motion >= b.max_consecutive {
            return false;
        }

        est.response >= b.high_confidence
            || (est.response >= b.moderate_confidence && self.prior_confidence >= b.prior_confidence)
    }

    fn motion_step(&mut self, frame: &GrayFrame) -> Result<Option<TranslationEstimate>> {
        if !self.bypass.use_roi_tracking {
            return Ok(None);
        }

        if self.last.is_none() {
            self.translation.prime(frame)?;
            return Ok(None);
        }

        let est = self.translation.track(frame)?;

        Ok(est.shift.map(|_| est))
    }

    /// Frame-pixel shift in reference pixels, scaled by the last viewport's size.
    fn reference_shift(&self, frame: &GrayFrame, last: &Viewport, est: &TranslationEstimate) -> Option<(f64, f64)> {
        let (dx, dy) = est.shift?;
        let k = if frame.width() > 0 {
            last.width / frame.width() as f64
        } else {
            1.0
        };

        Some((dx * k, dy * k))
    }

    fn search_region(&self, motion_center: Option<(f64, f64)>, hint: Option<&Roi>) -> Option<Roi> {
        if !self.bypass.use_roi_tracking {
            return None;
        }

        let last = self.last.as_ref();

        match (motion_center, last) {
            (Some((cx, cy)), Some(last)) => Some(Roi {
                viewport: BBox::xywh(cx, cy, last.width, last.height),
                expansion: self.bypass.motion_roi_expansion,
            }),
            _ => hint.copied().or_else(|| {
                last.map(|v| Roi {
                    viewport: v.center_box(),
                    expansion: self.bypass.last_viewport_roi_expansion,
                })
            }),
        }
    }
}

impl FrameRegistrar for CascadeScaleMatcher {
    fn register(&mut self, frame: &GrayFrame, hint: Option<&Roi>, cancel: &CancelToken) -> Result<Registration> {
        let started = Instant::now();

        if frame.is_empty() {
            return Err(Error::malformed("empty frame"));
        }

        let estimate = self.motion_step(frame)?;
        let mut motion_center = None;

        if let (Some(est), Some(last)) = (estimate, self.last) {
            if let Some((dx, dy)) = self.reference_shift(frame, &last, &est) {
                let moved = last.translated(dx, dy);
                motion_center = Some(moved.center());

                if self.bypass_allowed(&est) {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }

                    let movement = est.magnitude().unwrap_or(0.0);
                    let decay = if movement < self.bypass.static_motion_px {
                        self.bypass.static_decay
                    } else {
                        self.bypass.motion_decay
                    };

                    let decayed = self.prior_confidence * decay;
                    let confidence = est.response.max(decayed);
                    let viewport = Viewport {
                        confidence: confidence.clamp(0.0, 1.0),
                        timestamp: frame.timestamp,
                        ..moved
                    };

                    self.last = Some(viewport);
                    self.prior_confidence = decayed;
                    self.consecutive_motion += 1;

                    tracing::debug!(
                        dx,
                        dy,
                        response = est.response,
                        prior = decayed,
                        streak = self.consecutive_motion,
                        "motion-only bypass"
                    );

                    return Ok(Registration {
                        viewport,
                        inliers: 0,
                        total_matches: 0,
                        match_type: MatchType::MotionOnly,
                        trail: Vec::new(),
                        elapsed: started.elapsed(),
                        roi_applied: false,
                    });
                }
            }
        }

        let roi = self.search_region(motion_center, hint);
        let mut trail = Vec::with_capacity(self.rungs.len());

        for rung in &self.rungs {
            if cancel.is_cancelled() {
                tracing::debug!(tried = trail.len(), "registration cancelled between rungs");
                return Err(Error::Cancelled);
            }

            let outcome = self.matcher.match_frame(frame, rung, roi.as_ref())?;
            let accepted = outcome.accepted();
            let roi_applied = outcome.roi_applied;
            let viewport = outcome.viewport;

            trail.push(outcome.attempt);

            if let (true, Some(viewport)) = (accepted, viewport) {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                self.last = Some(viewport);
                self.prior_confidence = viewport.confidence;
                self.consecutive_motion = 0;

                let (inliers, total_matches) = trail
                    .last()
                    .map(|a| (a.inliers, a.matches))
                    .unwrap_or_default();

                tracing::debug!(
                    rung = %rung.name,
                    confidence = viewport.confidence,
                    inliers,
                    "feature registration accepted"
                );

                return Ok(Registration {
                    viewport,
                    inliers,
                    total_matches,
                    match_type: MatchType::Feature,
                    trail,
                    elapsed: started.elapsed(),
                    roi_applied,
                });
            }
        }

        tracing::debug!(tried = trail.len(), "every rung rejected the frame");

        Err(Error::Exhausted(Box::new(MatchFailure {
            trail,
            elapsed: started.elapsed(),
        })))
    }

    fn reset(&mut self) {
        self.last = None;
        self.prior_confidence = 0.0;
        self.consecutive_motion = 0;
        self.translation.reset();
    }
}
