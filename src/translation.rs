use opencv::core::{self as cv, Mat};
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::TranslationConfig;
use crate::error::Result;
use crate::frame::GrayFrame;
use crate::rolling_avg::RollingAvg;

/// Result of one correlation step. `shift` is `None` when there was nothing to compare
/// against or the response fell below the threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranslationEstimate {
    /// Viewport movement in full-resolution frame pixels.
    pub shift: Option<(f64, f64)>,
    pub response: f64,
    /// Frame pixels per second between the last two accepted shifts.
    pub velocity: Option<(f64, f64)>,
    pub scale: f64,
}

impl TranslationEstimate {
    fn none(response: f64, scale: f64) -> Self {
        Self {
            shift: None,
            response,
            velocity: None,
            scale,
        }
    }

    #[inline]
    pub fn magnitude(&self) -> Option<f64> {
        self.shift.map(|(dx, dy)| dx.hypot(dy))
    }
}

/// Inter-frame translation by phase correlation of downsampled frames.
#[derive(Debug, Clone)]
pub struct TranslationTracker {
    cfg: TranslationConfig,
    scale: f64,
    next_scale: f64,
    prev: Option<GrayFrame>,
    prev_dims: Option<(usize, usize)>,
    last_accepted_ts: Option<f64>,
    movement: RollingAvg,
}

impl TranslationTracker {
    pub fn new(cfg: TranslationConfig) -> Self {
        let scale = Self::initial_scale(&cfg);

        Self {
            movement: RollingAvg::new(cfg.history),
            cfg,
            scale,
            next_scale: scale,
            prev: None,
            prev_dims: None,
            last_accepted_ts: None,
        }
    }

    fn initial_scale(cfg: &TranslationConfig) -> f64 {
        if cfg.adaptive {
            0.5
        } else {
            cfg.scale
        }
    }

    #[inline]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    #[inline]
    pub fn is_primed(&self) -> bool {
        self.prev.is_some()
    }

    pub fn reset(&mut self) {
        self.scale = Self::initial_scale(&self.cfg);
        self.next_scale = self.scale;
        self.prev = None;
        self.prev_dims = None;
        self.last_accepted_ts = None;
        self.movement.clear();
    }

    /// Stores `frame` as the comparison base without correlating.
    pub fn prime(&mut self, frame: &GrayFrame) -> Result<()> {
        self.apply_pending_scale();
        self.prev = Some(frame.resized(self.scale)?);
        self.prev_dims = Some(frame.dims());

        Ok(())
    }

    pub fn track(&mut self, frame: &GrayFrame) -> Result<TranslationEstimate> {
        self.apply_pending_scale();

        if self.prev_dims.map_or(false, |d| d != frame.dims()) {
            tracing::debug!(dims = ?frame.dims(), "frame size changed, dropping stored frame");
            self.prev = None;
        }

        let curr = frame.resized(self.scale)?;
        self.prev_dims = Some(frame.dims());

        let prev = match self.prev.take() {
            Some(p) => p,
            None => {
                self.prev = Some(curr);
                return Ok(TranslationEstimate::none(0.0, self.scale));
            }
        };

        let correlated = phase_shift(&prev, &curr);
        self.prev = Some(curr);
        let (dx, dy, response) = correlated?;

        if !(response >= self.cfg.min_confidence) {
            return Ok(TranslationEstimate::none(response, self.scale));
        }

        // content moves opposite to the viewport
        let shift = (-dx / self.scale, -dy / self.scale);

        let velocity = match self.last_accepted_ts {
            Some(ts) if frame.timestamp > ts => {
                let dt = frame.timestamp - ts;
                Some((shift.0 / dt, shift.1 / dt))
            }
            _ => None,
        };
        self.last_accepted_ts = Some(frame.timestamp);

        let estimate = TranslationEstimate {
            shift: Some(shift),
            response,
            velocity,
            scale: self.scale,
        };

        if self.cfg.adaptive {
            self.adapt(shift.0.hypot(shift.1));
        }

        Ok(estimate)
    }

    fn adapt(&mut self, magnitude: f64) {
        self.movement.push(magnitude);

        let avg = self.movement.mean().unwrap_or(magnitude);
        self.next_scale = if avg > 200.0 {
            0.25
        } else if avg > 50.0 {
            0.5
        } else {
            0.75
        };
    }

    fn apply_pending_scale(&mut self) {
        if (self.next_scale - self.scale).abs() > f64::EPSILON {
            tracing::debug!(from = self.scale, to = self.next_scale, "translation scale changed");

            self.scale = self.next_scale;
            self.prev = None;
        }
    }
}

/// `(dx, dy, response)` of `curr` relative to `prev`, in the frames' own pixels.
pub fn phase_shift(prev: &GrayFrame, curr: &GrayFrame) -> Result<(f64, f64, f64)> {
    let a = to_f32(prev)?;
    let b = to_f32(curr)?;

    let mut response = 0.0;
    let shift = imgproc::phase_correlate(&a, &b, &Mat::default(), &mut response)?;

    if !response.is_finite() {
        response = 0.0;
    }

    Ok((shift.x, shift.y, response))
}

fn to_f32(frame: &GrayFrame) -> Result<Mat> {
    let src = frame.to_mat()?;
    let mut dst = Mat::default();
    src.convert_to(&mut dst, cv::CV_32F, 1.0, 0.0)?;

    Ok(dst)
}
